//! Event Hub payloads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use silentq_core::{Behavior, OperationId, PlaceholderToken, QueueError, RequestSpec};

/// Read-only view of a queued operation at the moment an event fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub queue: String,
    pub behavior: Behavior,
    pub durable: bool,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub request: RequestSpec,
    pub placeholder_refs: Vec<PlaceholderToken>,
    pub linked_state: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootEvent {
    /// Queues restored from storage with their operation counts, in name order.
    pub restored: Vec<(String, usize)>,
}

/// Fired before (`on_before_push`) and after (`on_pushed`) an operation joins a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub operation: OperationSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEvent {
    pub operation: OperationSnapshot,
    pub result: Value,
}

/// A single failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub operation: OperationSnapshot,
    pub error: QueueError,
    /// `Some` when another attempt is scheduled after this delay.
    pub retry_in: Option<Duration>,
}

/// Final failure; fired once, after fallback handlers ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailEvent {
    pub operation: OperationSnapshot,
    pub error: QueueError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { result: Value },
    Failed { error: QueueError },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteEvent {
    pub operation: OperationSnapshot,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageAction {
    Save,
    Remove,
    Load,
    ListQueues,
}

/// Advisory storage failure; the queue keeps operating in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceErrorEvent {
    pub queue: String,
    pub operation_id: Option<OperationId>,
    pub action: StorageAction,
    pub error: QueueError,
}
