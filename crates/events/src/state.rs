//! Plain state-change messages for reactive exposure.

use serde::{Deserialize, Serialize};

use silentq_core::{OperationId, QueueError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateChange {
    /// An operation of this queue is (or stopped being) in flight.
    Loading(bool),
    /// Current queue contents, head first.
    Contents(Vec<OperationId>),
    /// Most recent failure; cleared by the next success.
    LastError(Option<QueueError>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStateChange {
    pub queue: String,
    pub change: StateChange,
}

/// Folded view of the state-change stream for one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub loading: bool,
    pub contents: Vec<OperationId>,
    pub last_error: Option<QueueError>,
}

impl QueueStatus {
    pub fn apply(&mut self, change: &StateChange) {
        match change {
            StateChange::Loading(loading) => self.loading = *loading,
            StateChange::Contents(ids) => self.contents = ids.clone(),
            StateChange::LastError(err) => self.last_error = err.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_folds_changes() {
        let id = OperationId::new();
        let mut status = QueueStatus::default();

        status.apply(&StateChange::Contents(vec![id]));
        status.apply(&StateChange::Loading(true));
        status.apply(&StateChange::LastError(Some(QueueError::transient("offline"))));
        assert!(status.loading);
        assert_eq!(status.contents, vec![id]);

        status.apply(&StateChange::LastError(None));
        status.apply(&StateChange::Contents(vec![]));
        assert_eq!(status.last_error, None);
        assert!(status.contents.is_empty());
    }
}
