//! Queue error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{OperationId, PlaceholderToken};

/// Result type used across the queue crates.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Terminal outcomes delivered to `Queued` callers and Event Hub subscribers
/// are values of this type, so it is `Clone` and serializable.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum QueueError {
    /// Network or timeout failure; retryable per backoff policy.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// Malformed request; never retried.
    #[error("validation failure: {0}")]
    ValidationFailure(String),

    /// The retry budget is spent.
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Advisory storage failure; the queue keeps running in memory.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("placeholder {0} is already resolved")]
    AlreadyResolved(PlaceholderToken),

    #[error("unknown placeholder {0}")]
    UnknownPlaceholder(PlaceholderToken),

    /// Resolved, but its value is no longer retained for substitution.
    #[error("placeholder {0} was resolved and its value has expired")]
    PlaceholderExpired(PlaceholderToken),

    #[error("queue runtime already booted")]
    AlreadyBooted,

    #[error("queue runtime has not been booted")]
    NotBooted,

    /// The operation was removed before it reached a terminal state.
    #[error("operation {0} was removed")]
    Removed(OperationId),

    #[error("no request handler registered under '{0}'")]
    UnknownHandler(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl QueueError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientFailure(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailure(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::PersistenceFailure(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether the scheduler may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure(_))
    }
}

/// Outcome of a single send through the transport capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("validation: {0}")]
    Validation(String),
    /// The in-flight send was cancelled via `abort()`.
    #[error("send aborted")]
    Aborted,
}

impl From<SendError> for QueueError {
    fn from(value: SendError) -> Self {
        match value {
            SendError::Transient(msg) => QueueError::TransientFailure(msg),
            SendError::Validation(msg) => QueueError::ValidationFailure(msg),
            // An abort counts as a failed attempt for retry accounting.
            SendError::Aborted => QueueError::TransientFailure("send aborted".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(QueueError::transient("timeout").is_retryable());
        assert!(QueueError::from(SendError::Aborted).is_retryable());
        assert!(!QueueError::validation("bad body").is_retryable());
        assert!(!QueueError::RetriesExhausted { attempts: 3, last_error: "x".into() }.is_retryable());
    }

    #[test]
    fn error_serializes_with_kind_tag() {
        let json = serde_json::to_value(QueueError::transient("offline")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "transient_failure", "detail": "offline"}));
    }
}
