//! Queued operation entity.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use silentq_core::{
    Behavior, DeferredField, OperationId, PlaceholderToken, QueueError, QueueResult, RequestSpec,
    RetryPolicy, collect_request_tokens, collect_tokens, substitute, substitute_request,
};
use silentq_events::{EventHub, OperationSnapshot, PersistenceErrorEvent, StorageAction};

use crate::storage::{PersistenceAdapter, SerializedOperation};
use crate::transport::HandlerRegistry;

/// Execution state.
///
/// `Pending -> Executing -> {Succeeded | Retrying -> Executing | FailedFinal}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Executing,
    Retrying,
    Succeeded,
    FailedFinal,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::FailedFinal)
    }
}

/// Passed to fallback handlers after the final failure.
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub operation: OperationSnapshot,
    pub error: QueueError,
}

/// Passed to retry handlers before the delayed re-attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation: OperationSnapshot,
    /// Attempts made so far, including the one that just failed.
    pub attempt: u32,
    pub delay: Duration,
    pub error: QueueError,
}

pub type FallbackHandler = Arc<dyn Fn(&FallbackContext) + Send + Sync>;
pub type RetryHandler = Arc<dyn Fn(&RetryContext) + Send + Sync>;

/// The unit of work held by a queue.
///
/// Fallback handlers, retry handlers and the completion sender are
/// transient: they are never serialized and a rehydrated operation starts
/// without them.
pub struct QueuedOperation {
    pub(crate) id: OperationId,
    pub(crate) queue: String,
    pub(crate) sequence: u64,
    pub(crate) durable: bool,
    pub(crate) behavior: Behavior,
    pub(crate) request: RequestSpec,
    pub(crate) handler: Option<String>,
    pub(crate) handler_args: Vec<Value>,
    pub(crate) retry: RetryPolicy,
    /// Attempts started. Bumped and stored before each send.
    pub(crate) attempt_count: u32,
    pub(crate) state: OperationState,
    pub(crate) placeholder_refs: BTreeSet<PlaceholderToken>,
    pub(crate) produces: Vec<DeferredField>,
    pub(crate) linked_state: Option<String>,
    pub(crate) created_at: DateTime<Utc>,

    pub(crate) fallback_handlers: Vec<FallbackHandler>,
    pub(crate) retry_handlers: Vec<RetryHandler>,
    pub(crate) completion: Option<oneshot::Sender<QueueResult<Value>>>,
}

impl std::fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("behavior", &self.behavior)
            .field("state", &self.state)
            .field("attempt_count", &self.attempt_count)
            .field("placeholder_refs", &self.placeholder_refs)
            .finish_non_exhaustive()
    }
}

impl QueuedOperation {
    pub fn create(request: RequestSpec, behavior: Behavior, retry: RetryPolicy, durable: bool) -> Self {
        let mut op = Self {
            id: OperationId::new(),
            queue: String::new(),
            sequence: 0,
            durable,
            behavior,
            request,
            handler: None,
            handler_args: Vec::new(),
            retry,
            attempt_count: 0,
            state: OperationState::Pending,
            placeholder_refs: BTreeSet::new(),
            produces: Vec::new(),
            linked_state: None,
            created_at: Utc::now(),
            fallback_handlers: Vec::new(),
            retry_handlers: Vec::new(),
            completion: None,
        };
        op.refresh_refs();
        op
    }

    /// Remember the builder that produced `request` so it can be rebuilt.
    pub fn with_handler(mut self, name: impl Into<String>, args: Vec<Value>) -> Self {
        self.handler = Some(name.into());
        self.handler_args = args;
        self.refresh_refs();
        self
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn request(&self) -> &RequestSpec {
        &self.request
    }

    pub fn placeholder_refs(&self) -> &BTreeSet<PlaceholderToken> {
        &self.placeholder_refs
    }

    fn refresh_refs(&mut self) {
        let mut refs = BTreeSet::new();
        collect_request_tokens(&self.request, &mut refs);
        for arg in &self.handler_args {
            collect_tokens(arg, &mut refs);
        }
        self.placeholder_refs = refs;
    }

    /// Mirror this operation to storage. No-op unless durable.
    ///
    /// Failures are logged and reported on the hub; they never reach the caller.
    pub async fn save(&self, storage: &dyn PersistenceAdapter, hub: &EventHub) {
        if self.durable {
            save_advisory(storage, hub, &self.queue, &self.to_serialized()).await;
        }
    }

    /// Delete the stored copy, if any. Safe to call repeatedly.
    pub async fn remove_persisted(&self, storage: &dyn PersistenceAdapter, hub: &EventHub) {
        if self.durable {
            remove_advisory(storage, hub, &self.queue, self.id).await;
        }
    }

    pub fn to_serialized(&self) -> SerializedOperation {
        SerializedOperation {
            id: self.id,
            queue: self.queue.clone(),
            sequence: self.sequence,
            behavior: self.behavior,
            request: self.request.clone(),
            handler: self.handler.clone(),
            handler_args: self.handler_args.clone(),
            retry: self.retry.clone(),
            attempt_count: self.attempt_count,
            placeholder_refs: self.placeholder_refs.clone(),
            produces: self.produces.clone(),
            linked_state: self.linked_state.clone(),
            created_at: self.created_at,
        }
    }

    /// Rebuild from storage. Transient callbacks start empty.
    pub fn rehydrate(stored: SerializedOperation) -> Self {
        Self {
            id: stored.id,
            queue: stored.queue,
            sequence: stored.sequence,
            durable: true,
            behavior: stored.behavior,
            request: stored.request,
            handler: stored.handler,
            handler_args: stored.handler_args,
            retry: stored.retry,
            attempt_count: stored.attempt_count,
            state: OperationState::Pending,
            placeholder_refs: stored.placeholder_refs,
            produces: stored.produces,
            linked_state: stored.linked_state,
            created_at: stored.created_at,
            fallback_handlers: Vec::new(),
            retry_handlers: Vec::new(),
            completion: None,
        }
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id,
            queue: self.queue.clone(),
            behavior: self.behavior,
            durable: self.durable,
            attempt_count: self.attempt_count,
            max_attempts: self.retry.max_attempts,
            request: self.request.clone(),
            placeholder_refs: self.placeholder_refs.iter().copied().collect(),
            linked_state: self.linked_state.clone(),
            created_at: self.created_at,
        }
    }

    /// Substitute a resolved placeholder and regenerate the request.
    ///
    /// With a registered handler the request is rebuilt from the substituted
    /// arguments; otherwise the substitution is applied to the stored request
    /// directly. Returns `false` if the operation did not reference `token`.
    pub fn apply_resolution(
        &mut self,
        token: PlaceholderToken,
        value: &Value,
        handlers: &HandlerRegistry,
    ) -> bool {
        if !self.placeholder_refs.remove(&token) {
            return false;
        }

        for arg in &mut self.handler_args {
            substitute(arg, token, value);
        }

        let rebuilt = match self.handler.as_deref() {
            Some(name) if handlers.contains(name) => match handlers.build(name, &self.handler_args) {
                Ok(spec) => Some(spec),
                Err(err) => {
                    tracing::warn!(
                        operation_id = %self.id,
                        handler = name,
                        error = %err,
                        "failed to rebuild request; substituting in place"
                    );
                    None
                }
            },
            _ => None,
        };

        match rebuilt {
            Some(spec) => self.request = spec,
            None => {
                substitute_request(&mut self.request, token, value);
            }
        }
        true
    }

    pub(crate) fn complete(&mut self, result: QueueResult<Value>) {
        if let Some(tx) = self.completion.take() {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        }
    }

    pub(crate) fn produced_tokens(&self) -> impl Iterator<Item = PlaceholderToken> + '_ {
        self.produces.iter().map(|f| f.token)
    }
}

pub(crate) async fn save_advisory(
    storage: &dyn PersistenceAdapter,
    hub: &EventHub,
    queue: &str,
    op: &SerializedOperation,
) {
    if let Err(err) = storage.save(queue, op).await {
        tracing::warn!(queue, operation_id = %op.id, error = %err, "failed to persist operation");
        hub.emit_persistence_error(&PersistenceErrorEvent {
            queue: queue.to_string(),
            operation_id: Some(op.id),
            action: StorageAction::Save,
            error: err.into(),
        });
    }
}

pub(crate) async fn remove_advisory(
    storage: &dyn PersistenceAdapter,
    hub: &EventHub,
    queue: &str,
    id: OperationId,
) {
    if let Err(err) = storage.remove(queue, id).await {
        tracing::warn!(queue, operation_id = %id, error = %err, "failed to remove persisted operation");
        hub.emit_persistence_error(&PersistenceErrorEvent {
            queue: queue.to_string(),
            operation_id: Some(id),
            action: StorageAction::Remove,
            error: err.into(),
        });
    }
}

/// Handle to the eventual outcome of a `Queued` operation.
#[derive(Debug)]
pub struct Completion {
    id: OperationId,
    rx: oneshot::Receiver<QueueResult<Value>>,
}

impl Completion {
    pub(crate) fn new(id: OperationId, rx: oneshot::Receiver<QueueResult<Value>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Wait for the real result. Fails with `Removed` if the operation was
    /// removed (or the queue shut down) before finishing.
    pub async fn wait(self) -> QueueResult<Value> {
        let Completion { id, rx } = self;
        rx.await.unwrap_or(Err(QueueError::Removed(id)))
    }
}

/// Returned by `submit`.
#[derive(Debug)]
pub struct Submission {
    pub id: OperationId,
    pub queue: String,
    pub behavior: Behavior,
    /// Optimistic result with deferred fields replaced by placeholder tokens.
    pub virtual_response: Value,
    /// One entry per deferred field, in declaration order.
    pub placeholders: Vec<DeferredField>,
    pub(crate) completion: Option<Completion>,
}

impl Submission {
    /// Token standing in for the deferred field at `pointer`.
    pub fn placeholder(&self, pointer: &str) -> Option<PlaceholderToken> {
        self.placeholders
            .iter()
            .find(|f| f.pointer == pointer)
            .map(|f| f.token)
    }

    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    /// `Silent`: the virtual response, immediately. `Queued`: the real result
    /// or the final error.
    pub async fn wait(self) -> QueueResult<Value> {
        match self.completion {
            Some(completion) => completion.wait().await,
            None => Ok(self.virtual_response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_collects_placeholder_refs() {
        let t1 = PlaceholderToken::new();
        let t2 = PlaceholderToken::new();
        let spec = RequestSpec::new("PUT", format!("/todos/{}", t1.marker()), json!({"parent": t2.to_value()}));

        let op = QueuedOperation::create(spec, Behavior::Silent, RetryPolicy::default(), true);
        assert_eq!(op.placeholder_refs(), &BTreeSet::from([t1, t2]));
        assert_eq!(op.state(), OperationState::Pending);
        assert_eq!(op.attempt_count(), 0);
    }

    #[test]
    fn serialized_form_round_trips_without_callbacks() {
        let mut op = QueuedOperation::create(
            RequestSpec::post("/todos", json!({"title": "a"})),
            Behavior::Queued,
            RetryPolicy::fixed(4, Duration::from_millis(10)),
            true,
        );
        op.queue = "todos".to_string();
        op.attempt_count = 2;
        op.fallback_handlers.push(Arc::new(|_: &FallbackContext| {}));
        let (tx, _rx) = oneshot::channel();
        op.completion = Some(tx);

        let stored = op.to_serialized();
        let json = serde_json::to_string(&stored).unwrap();
        let back = QueuedOperation::rehydrate(serde_json::from_str(&json).unwrap());

        assert_eq!(back.to_serialized(), stored);
        assert!(back.fallback_handlers.is_empty());
        assert!(back.completion.is_none());
    }

    #[test]
    fn resolution_rebuilds_through_handler() {
        let handlers = HandlerRegistry::new();
        handlers.register("add_child", |args| {
            Ok(RequestSpec::post("/children", json!({"parent": args[0].clone()})))
        });

        let t = PlaceholderToken::new();
        let args = vec![t.to_value()];
        let spec = handlers.build("add_child", &args).unwrap();
        let mut op = QueuedOperation::create(spec, Behavior::Silent, RetryPolicy::default(), true)
            .with_handler("add_child", args);

        assert!(op.apply_resolution(t, &json!(99), &handlers));
        assert_eq!(op.request().body, json!({"parent": 99}));
        assert_eq!(op.handler_args, vec![json!(99)]);
        assert!(op.placeholder_refs().is_empty());
        assert!(!op.apply_resolution(t, &json!(100), &handlers));
    }

    #[test]
    fn resolution_without_handler_substitutes_in_place() {
        let handlers = HandlerRegistry::new();
        let t = PlaceholderToken::new();
        let spec = RequestSpec::new("DELETE", format!("/todos/{}", t.marker()), Value::Null);
        let mut op = QueuedOperation::create(spec, Behavior::Silent, RetryPolicy::default(), false)
            .with_handler("not_registered", Vec::new());

        assert!(op.apply_resolution(t, &json!("srv-7"), &handlers));
        assert_eq!(op.request().target, "/todos/srv-7");
    }

    #[tokio::test]
    async fn completion_reports_removed_when_dropped() {
        let (tx, rx) = oneshot::channel();
        let id = OperationId::new();
        drop(tx);
        assert_eq!(Completion::new(id, rx).wait().await, Err(QueueError::Removed(id)));
    }
}
