//! Boot/recovery: reload stored queues and start their workers.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use silentq_core::{QueueError, QueueResult};
use silentq_events::{BootEvent, PersistenceErrorEvent, StateChange, StorageAction};

use crate::operation::QueuedOperation;
use crate::runtime::SilentQueue;
use crate::storage::SerializedOperation;

impl SilentQueue {
    /// Load every stored queue, restore its operations in stored order and
    /// start the queue workers.
    ///
    /// Runs at most once per runtime; a second call fails with
    /// `AlreadyBooted`. Storage failures are reported on the hub and the
    /// affected queues start empty. Submissions are accepted once this
    /// returns; workers start after `QueueConfig::boot_delay`.
    pub async fn boot(&self) -> QueueResult<BootEvent> {
        let shared = &self.shared;
        if shared.boot_started.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyBooted);
        }

        let names = match shared.storage.list_queues().await {
            Ok(names) => names,
            Err(err) => {
                tracing::error!(error = %err, "failed to list stored queues");
                shared.hub.emit_persistence_error(&PersistenceErrorEvent {
                    queue: String::new(),
                    operation_id: None,
                    action: StorageAction::ListQueues,
                    error: err.into(),
                });
                BTreeSet::new()
            }
        };

        let mut loaded: Vec<(String, Vec<SerializedOperation>)> = Vec::with_capacity(names.len());
        for name in names {
            match shared.storage.load(&name).await {
                Ok(ops) => loaded.push((name, ops)),
                Err(err) => {
                    tracing::error!(queue = %name, error = %err, "failed to load stored queue");
                    shared.hub.emit_persistence_error(&PersistenceErrorEvent {
                        queue: name,
                        operation_id: None,
                        action: StorageAction::Load,
                        error: err.into(),
                    });
                }
            }
        }

        let mut restored = Vec::with_capacity(loaded.len());
        let mut next_sequence = 0;
        let mut contents = Vec::with_capacity(loaded.len());
        {
            let mut table = shared.placeholders.lock();
            // Producers first, so references between restored operations bind
            // to pending tokens instead of becoming orphans.
            for stored in loaded.iter().flat_map(|(_, ops)| ops.iter()) {
                for field in &stored.produces {
                    table.register(field.token, Some(stored.id));
                }
            }

            let mut queues = shared.queues.lock();
            for (name, ops) in loaded {
                if ops.is_empty() {
                    continue;
                }
                let count = ops.len();
                let slot = queues.slot_mut(&name);
                for stored in ops {
                    next_sequence = next_sequence.max(stored.sequence + 1);
                    let mut op = QueuedOperation::rehydrate(stored);
                    op.queue = name.clone();
                    let refs = op.placeholder_refs.clone();
                    for (token, value) in table.bind(op.id, &refs) {
                        op.apply_resolution(token, &value, &shared.handlers);
                    }
                    slot.ops.push_back(op);
                }
                tracing::info!(queue = %name, operations = count, "queue restored");
                contents.push((name.clone(), slot.contents()));
                restored.push((name, count));
            }
        }

        shared.sequence.fetch_max(next_sequence, Ordering::AcqRel);
        for (name, ids) in contents {
            shared.publish(&name, StateChange::Contents(ids));
        }

        shared.booted.store(true, Ordering::Release);
        let event = BootEvent { restored };
        tracing::info!(queues = event.restored.len(), "silent queue booted");
        shared.hub.emit_boot(&event);

        let delay = shared.config.boot_delay;
        if delay.is_zero() {
            shared.start_workers();
        } else {
            let shared = shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if shared.booted.load(Ordering::Acquire) {
                    shared.start_workers();
                }
            });
        }

        Ok(event)
    }
}
