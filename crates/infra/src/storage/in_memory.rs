use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use silentq_core::OperationId;

use super::{PersistenceAdapter, SerializedOperation, StorageError};

/// Process-local storage, mainly for tests and for apps that opt out of disk.
///
/// Contents survive as long as the value does, so sharing one instance
/// between two runtimes simulates a restart.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    queues: RwLock<HashMap<String, Vec<SerializedOperation>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored operations across all queues.
    pub fn len(&self) -> usize {
        self.queues
            .read()
            .map(|q| q.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned<T>(_: T) -> StorageError {
        StorageError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryStorage {
    async fn save(&self, queue: &str, op: &SerializedOperation) -> Result<(), StorageError> {
        let mut queues = self.queues.write().map_err(Self::poisoned)?;
        let ops = queues.entry(queue.to_string()).or_default();
        match ops.iter_mut().find(|existing| existing.id == op.id) {
            Some(existing) => *existing = op.clone(),
            None => {
                ops.push(op.clone());
                ops.sort_by_key(|o| o.sequence);
            }
        }
        Ok(())
    }

    async fn load(&self, queue: &str) -> Result<Vec<SerializedOperation>, StorageError> {
        let queues = self.queues.read().map_err(Self::poisoned)?;
        Ok(queues.get(queue).cloned().unwrap_or_default())
    }

    async fn remove(&self, queue: &str, id: OperationId) -> Result<(), StorageError> {
        let mut queues = self.queues.write().map_err(Self::poisoned)?;
        if let Some(ops) = queues.get_mut(queue) {
            ops.retain(|o| o.id != id);
            if ops.is_empty() {
                queues.remove(queue);
            }
        }
        Ok(())
    }

    async fn list_queues(&self) -> Result<BTreeSet<String>, StorageError> {
        let queues = self.queues.read().map_err(Self::poisoned)?;
        Ok(queues.keys().cloned().collect())
    }
}
