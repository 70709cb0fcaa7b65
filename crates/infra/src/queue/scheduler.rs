//! Per-queue serial worker.
//!
//! One task per non-empty queue. The head operation is executed, retried
//! with backoff, and finalised before the next one is looked at, so a later
//! submission never overtakes an earlier one. The worker exits when its
//! queue drains and is respawned by the next push.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use silentq_core::{OperationId, QueueError, RequestSpec, SendError};
use silentq_events::{
    CompleteEvent, ErrorEvent, FailEvent, OperationSnapshot, Outcome, StateChange, SuccessEvent,
};

use crate::operation::{
    FallbackContext, OperationState, QueuedOperation, RetryContext, RetryHandler,
};
use crate::queue::InFlight;
use crate::runtime::Shared;
use crate::storage::SerializedOperation;

enum Prepared {
    Send {
        id: OperationId,
        request: RequestSpec,
        durable: bool,
        stored: Option<SerializedOperation>,
        cancel: CancellationToken,
        attempt: u32,
        unresolved: usize,
    },
    /// Restored with its attempt budget already spent.
    Exhausted { id: OperationId, attempts: u32 },
}

enum AfterSend {
    Removed,
    Succeeded(QueuedOperation, Value),
    Retry {
        snapshot: OperationSnapshot,
        stored: Option<SerializedOperation>,
        handlers: Vec<RetryHandler>,
        backoff: CancellationToken,
        attempt: u32,
        delay: Duration,
        error: QueueError,
    },
    Failed(QueueError),
}

pub(crate) async fn run_queue(shared: Arc<Shared>, queue: String) {
    info!(queue = %queue, "queue worker started");

    loop {
        if !shared.workers_enabled.load(Ordering::Acquire) {
            break;
        }

        let prepared = {
            let mut queues = shared.queues.lock();
            let slot = queues.slot_mut(&queue);
            let Some(op) = slot.ops.front_mut() else {
                slot.worker = None;
                slot.in_flight = None;
                break;
            };

            if op.attempt_count >= op.retry.max_attempts {
                Prepared::Exhausted {
                    id: op.id,
                    attempts: op.attempt_count,
                }
            } else {
                op.state = OperationState::Executing;
                // The stored copy already counts the attempt it is about to make.
                op.attempt_count += 1;
                let id = op.id;
                let cancel = CancellationToken::new();
                let prepared = Prepared::Send {
                    id,
                    request: op.request.clone(),
                    durable: op.durable,
                    stored: op.durable.then(|| op.to_serialized()),
                    cancel: cancel.clone(),
                    attempt: op.attempt_count,
                    unresolved: op.placeholder_refs.len(),
                };
                slot.in_flight = Some(InFlight {
                    id,
                    cancel,
                    removed: false,
                    executing: false,
                });
                prepared
            }
        };

        let (id, request, durable, stored, cancel, attempt, unresolved) = match prepared {
            Prepared::Exhausted { id, attempts } => {
                let error = QueueError::RetriesExhausted {
                    attempts,
                    last_error: "attempt budget spent before restart".to_string(),
                };
                finish_failure(&shared, &queue, id, error).await;
                continue;
            }
            Prepared::Send {
                id,
                request,
                durable,
                stored,
                cancel,
                attempt,
                unresolved,
            } => (id, request, durable, stored, cancel, attempt, unresolved),
        };

        shared.publish(&queue, StateChange::Loading(true));

        // The attempt is on disk before it goes on the wire.
        if let Some(stored) = &stored {
            shared.save(&queue, stored).await;
        }

        if !begin_send(&shared, &queue, id) {
            drop_removed(&shared, &queue, id, durable).await;
            continue;
        }

        if unresolved > 0 {
            warn!(queue = %queue, operation_id = %id, unresolved, "sending with unresolved placeholders");
        }
        debug!(queue = %queue, operation_id = %id, attempt, target = %request.target, "sending operation");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SendError::Aborted),
            result = shared.transport.send(&request) => result,
        };

        shared.publish(&queue, StateChange::Loading(false));

        match after_send(&shared, &queue, id, outcome) {
            AfterSend::Removed => drop_removed(&shared, &queue, id, durable).await,
            AfterSend::Succeeded(op, result) => finish_success(&shared, &queue, op, result).await,
            AfterSend::Failed(error) => finish_failure(&shared, &queue, id, error).await,
            AfterSend::Retry {
                snapshot,
                stored,
                handlers,
                backoff,
                attempt,
                delay,
                error,
            } => {
                warn!(
                    queue = %queue,
                    operation_id = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );

                if let Some(stored) = &stored {
                    shared.save(&queue, stored).await;
                }

                shared.hub.emit_error(&ErrorEvent {
                    operation: snapshot.clone(),
                    error: error.clone(),
                    retry_in: Some(delay),
                });
                shared.publish(&queue, StateChange::LastError(Some(error.clone())));

                let context = RetryContext {
                    operation: snapshot,
                    attempt,
                    delay,
                    error,
                };
                for handler in &handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler(&context))).is_err() {
                        warn!(queue = %queue, operation_id = %id, "retry handler panicked");
                    }
                }

                tokio::select! {
                    _ = backoff.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }

                if take_removed(&shared, &queue, id) {
                    drop_removed(&shared, &queue, id, durable).await;
                }
            }
        }
    }

    info!(queue = %queue, "queue worker stopped");
}

/// Mark the prepared attempt as sending. `false` if it was removed meanwhile.
fn begin_send(shared: &Shared, queue: &str, id: OperationId) -> bool {
    let mut queues = shared.queues.lock();
    let slot = queues.slot_mut(queue);
    match slot.in_flight.as_mut() {
        Some(in_flight) if in_flight.id == id && !in_flight.removed => {
            in_flight.executing = true;
            true
        }
        _ => {
            slot.in_flight = None;
            false
        }
    }
}

/// Clear the attempt if `remove()` claimed it.
fn take_removed(shared: &Shared, queue: &str, id: OperationId) -> bool {
    let mut queues = shared.queues.lock();
    let slot = queues.slot_mut(queue);
    let removed = slot
        .in_flight
        .as_ref()
        .is_some_and(|f| f.id == id && f.removed)
        || slot.position(id).is_none();
    if removed {
        slot.in_flight = None;
    }
    removed
}

/// `remove()` already dropped the operation; a save issued by this worker
/// may have landed after its delete, so delete again.
async fn drop_removed(shared: &Shared, queue: &str, id: OperationId, durable: bool) {
    debug!(queue = %queue, operation_id = %id, "attempt dropped after removal");
    if durable {
        shared.unpersist(queue, id).await;
    }
}

fn after_send(
    shared: &Shared,
    queue: &str,
    id: OperationId,
    outcome: Result<Value, SendError>,
) -> AfterSend {
    let mut queues = shared.queues.lock();
    let slot = queues.slot_mut(queue);

    let removed = slot.in_flight.as_ref().is_some_and(|f| f.id == id && f.removed);
    if removed || slot.ops.front().map(|op| op.id) != Some(id) {
        slot.in_flight = None;
        return AfterSend::Removed;
    }

    match outcome {
        Ok(result) => {
            slot.in_flight = None;
            match slot.ops.pop_front() {
                Some(mut op) => {
                    op.state = OperationState::Succeeded;
                    AfterSend::Succeeded(op, result)
                }
                None => AfterSend::Removed,
            }
        }
        Err(err) => {
            let err = QueueError::from(err);
            // `abort()` may have cancelled the send token. The backoff waits
            // on a fresh one that only `remove()` cancels.
            let backoff = CancellationToken::new();
            if let Some(in_flight) = slot.in_flight.as_mut() {
                in_flight.executing = false;
                in_flight.cancel = backoff.clone();
            }
            let Some(op) = slot.ops.front_mut() else {
                return AfterSend::Removed;
            };

            if err.is_retryable() && op.retry.should_retry(op.attempt_count) {
                op.state = OperationState::Retrying;
                AfterSend::Retry {
                    snapshot: op.snapshot(),
                    stored: op.durable.then(|| op.to_serialized()),
                    handlers: op.retry_handlers.clone(),
                    backoff,
                    attempt: op.attempt_count,
                    delay: op.retry.delay_for_attempt(op.attempt_count),
                    error: err,
                }
            } else if matches!(err, QueueError::ValidationFailure(_)) {
                AfterSend::Failed(err)
            } else {
                let last_error = match err {
                    QueueError::TransientFailure(msg) => msg,
                    other => other.to_string(),
                };
                AfterSend::Failed(QueueError::RetriesExhausted {
                    attempts: op.attempt_count,
                    last_error,
                })
            }
        }
    }
}

async fn finish_success(shared: &Shared, queue: &str, mut op: QueuedOperation, result: Value) {
    info!(queue = %queue, operation_id = %op.id, attempts = op.attempt_count, "operation succeeded");

    for field in &op.produces {
        match result.pointer(&field.pointer) {
            Some(value) => match shared.resolve(field.token, value.clone()).await {
                Ok(()) => {}
                Err(QueueError::AlreadyResolved(token)) => {
                    debug!(operation_id = %op.id, token = %token, "placeholder already resolved");
                }
                Err(err) => {
                    warn!(operation_id = %op.id, token = %field.token, error = %err, "failed to resolve placeholder");
                }
            },
            None => {
                warn!(
                    operation_id = %op.id,
                    pointer = %field.pointer,
                    "result has no value for deferred field"
                );
                shared.placeholders.lock().orphan([field.token]);
            }
        }
    }
    shared.placeholders.lock().release(op.id, &op.placeholder_refs);

    op.complete(Ok(result.clone()));
    let snapshot = op.snapshot();
    shared.hub.emit_success(&SuccessEvent {
        operation: snapshot.clone(),
        result: result.clone(),
    });

    op.remove_persisted(shared.storage.as_ref(), &shared.hub).await;

    shared.hub.emit_complete(&CompleteEvent {
        operation: snapshot,
        outcome: Outcome::Succeeded { result },
    });
    shared.publish(queue, StateChange::Contents(shared.queues.contents(queue)));
    shared.publish(queue, StateChange::LastError(None));
}

async fn finish_failure(shared: &Shared, queue: &str, id: OperationId, error: QueueError) {
    let op = {
        let mut queues = shared.queues.lock();
        let slot = queues.slot_mut(queue);
        slot.in_flight = None;
        if slot.ops.front().map(|op| op.id) == Some(id) {
            slot.ops.pop_front()
        } else {
            None
        }
    };
    let Some(mut op) = op else {
        return;
    };
    op.state = OperationState::FailedFinal;

    error!(
        queue = %queue,
        operation_id = %id,
        attempts = op.attempt_count,
        error = %error,
        "operation failed permanently"
    );

    let snapshot = op.snapshot();
    let context = FallbackContext {
        operation: snapshot.clone(),
        error: error.clone(),
    };
    for handler in &op.fallback_handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(&context))).is_err() {
            warn!(queue = %queue, operation_id = %id, "fallback handler panicked");
        }
    }

    op.complete(Err(error.clone()));

    shared.hub.emit_error(&ErrorEvent {
        operation: snapshot.clone(),
        error: error.clone(),
        retry_in: None,
    });
    shared.hub.emit_fail(&FailEvent {
        operation: snapshot.clone(),
        error: error.clone(),
    });

    {
        let mut table = shared.placeholders.lock();
        table.orphan(op.produced_tokens());
        table.release(op.id, &op.placeholder_refs);
    }

    op.remove_persisted(shared.storage.as_ref(), &shared.hub).await;

    shared.hub.emit_complete(&CompleteEvent {
        operation: snapshot,
        outcome: Outcome::Failed {
            error: error.clone(),
        },
    });
    shared.publish(queue, StateChange::Contents(shared.queues.contents(queue)));
    shared.publish(queue, StateChange::LastError(Some(error)));
}
