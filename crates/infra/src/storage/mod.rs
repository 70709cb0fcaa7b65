//! Persistence adapter: durable mirror of queued operations.
//!
//! The in-memory queue is authoritative while the process runs; storage only
//! has to be good enough to rebuild it after a restart. Every method may fail,
//! and callers treat failures as advisory (log + event, keep going).

mod in_memory;
mod sqlite;

pub use in_memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use silentq_core::{
    Behavior, DeferredField, OperationId, PlaceholderToken, QueueError, RequestSpec, RetryPolicy,
};

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StorageError> for QueueError {
    fn from(err: StorageError) -> Self {
        QueueError::PersistenceFailure(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Storage form of a queued operation.
///
/// Carries everything needed to rebuild the operation except in-process
/// callbacks (fallback and retry handlers), which cannot be serialized.
/// Operations built from a named handler keep the handler name and its
/// arguments so the request can be rebuilt after substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedOperation {
    pub id: OperationId,
    pub queue: String,
    /// Monotonic insertion order; `load` returns operations sorted by it.
    pub sequence: u64,
    pub behavior: Behavior,
    pub request: RequestSpec,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub handler_args: Vec<Value>,
    pub retry: RetryPolicy,
    pub attempt_count: u32,
    #[serde(default)]
    pub placeholder_refs: BTreeSet<PlaceholderToken>,
    #[serde(default)]
    pub produces: Vec<DeferredField>,
    #[serde(default)]
    pub linked_state: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Insert or replace the stored copy of `op` in `queue`.
    async fn save(&self, queue: &str, op: &SerializedOperation) -> Result<(), StorageError>;

    /// All stored operations of `queue` in insertion order.
    async fn load(&self, queue: &str) -> Result<Vec<SerializedOperation>, StorageError>;

    /// Delete the stored copy; removing an absent id is not an error.
    async fn remove(&self, queue: &str, id: OperationId) -> Result<(), StorageError>;

    /// Names of all queues with at least one stored operation.
    async fn list_queues(&self) -> Result<BTreeSet<String>, StorageError>;
}
