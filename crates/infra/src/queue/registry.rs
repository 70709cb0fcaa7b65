use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use silentq_core::OperationId;
use silentq_events::OperationSnapshot;

use crate::operation::QueuedOperation;

/// The attempt currently owned by a queue worker (sending or backing off).
#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) id: OperationId,
    pub(crate) cancel: CancellationToken,
    /// Set by `remove()`; the worker drops the attempt without fallback.
    pub(crate) removed: bool,
    /// `true` only while the send itself is outstanding.
    pub(crate) executing: bool,
}

/// One named queue: FIFO operations plus its worker.
#[derive(Debug, Default)]
pub(crate) struct QueueSlot {
    pub(crate) ops: VecDeque<QueuedOperation>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) worker: Option<JoinHandle<()>>,
}

impl QueueSlot {
    pub(crate) fn contents(&self) -> Vec<OperationId> {
        self.ops.iter().map(|op| op.id).collect()
    }

    pub(crate) fn position(&self, id: OperationId) -> Option<usize> {
        self.ops.iter().position(|op| op.id == id)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Queues {
    slots: HashMap<String, QueueSlot>,
}

impl Queues {
    pub(crate) fn slot_mut(&mut self, name: &str) -> &mut QueueSlot {
        self.slots.entry(name.to_string()).or_default()
    }

    pub(crate) fn slot(&self, name: &str) -> Option<&QueueSlot> {
        self.slots.get(name)
    }

    pub(crate) fn slots_mut(&mut self) -> impl Iterator<Item = (&String, &mut QueueSlot)> {
        self.slots.iter_mut()
    }

    /// Name of the queue holding `id`.
    pub(crate) fn locate(&self, id: OperationId) -> Option<String> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.position(id).is_some())
            .map(|(name, _)| name.clone())
    }

    pub(crate) fn find(&self, id: OperationId) -> Option<&QueuedOperation> {
        self.slots
            .values()
            .flat_map(|slot| slot.ops.iter())
            .find(|op| op.id == id)
    }

    pub(crate) fn find_mut(&mut self, id: OperationId) -> Option<&mut QueuedOperation> {
        self.slots
            .values_mut()
            .flat_map(|slot| slot.ops.iter_mut())
            .find(|op| op.id == id)
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

/// All named queues of one runtime.
///
/// Created with the runtime and torn down by `shutdown()`. The lock is never
/// held across an await point.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    inner: Mutex<Queues>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Queues> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of queues that currently hold operations, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.lock();
        let mut names: Vec<String> = queues
            .slots
            .iter()
            .filter(|(_, slot)| !slot.ops.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Operation ids of `queue`, head first.
    pub fn contents(&self, queue: &str) -> Vec<OperationId> {
        self.lock().slot(queue).map(QueueSlot::contents).unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.lock().slot(queue).map_or(0, |slot| slot.ops.len())
    }

    pub fn get(&self, id: OperationId) -> Option<OperationSnapshot> {
        self.lock().find(id).map(QueuedOperation::snapshot)
    }

    pub fn filter<F>(&self, queue: &str, predicate: F) -> Vec<OperationSnapshot>
    where
        F: Fn(&OperationSnapshot) -> bool,
    {
        self.lock()
            .slot(queue)
            .map(|slot| {
                slot.ops
                    .iter()
                    .map(QueuedOperation::snapshot)
                    .filter(|snap| predicate(snap))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use silentq_core::{Behavior, RequestSpec, RetryPolicy};

    fn op(queue: &str, n: u64) -> QueuedOperation {
        let mut op = QueuedOperation::create(
            RequestSpec::post("/items", json!({"n": n})),
            Behavior::Silent,
            RetryPolicy::default(),
            false,
        );
        op.queue = queue.to_string();
        op.sequence = n;
        op
    }

    #[test]
    fn lookup_and_filter() {
        let registry = QueueRegistry::new();
        let (a, b, c) = (op("q1", 1), op("q1", 2), op("q2", 3));
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        {
            let mut queues = registry.lock();
            queues.slot_mut("q1").ops.extend([a, b]);
            queues.slot_mut("q2").ops.push_back(c);
            queues.slot_mut("empty");
            assert_eq!(queues.locate(c_id).as_deref(), Some("q2"));
        }

        assert_eq!(registry.queue_names(), vec!["q1".to_string(), "q2".to_string()]);
        assert_eq!(registry.contents("q1"), vec![a_id, b_id]);
        assert_eq!(registry.len("missing"), 0);
        assert_eq!(registry.get(b_id).map(|s| s.queue), Some("q1".to_string()));

        let big = registry.filter("q1", |s| s.request.body["n"].as_u64() == Some(2));
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].id, b_id);
    }
}
