//! Descriptor of the remote operation a queued entry replays.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque description of a request.
///
/// The queue never interprets these fields; they are handed to the
/// transport verbatim. Placeholder tokens may appear anywhere in `body`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub method: String,
    pub target: String,
    #[serde(default)]
    pub body: Value,
}

impl RequestSpec {
    pub fn new(method: impl Into<String>, target: impl Into<String>, body: Value) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            body,
        }
    }

    pub fn post(target: impl Into<String>, body: Value) -> Self {
        Self::new("POST", target, body)
    }
}
