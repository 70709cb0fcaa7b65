//! Outbound request seam and named request builders.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use silentq_core::{QueueError, RequestSpec, SendError};

/// Performs the actual network request for an operation.
///
/// Implementations classify failures: `SendError::Transient` is retried
/// according to the operation's policy, `SendError::Validation` is final.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestSpec) -> Result<Value, SendError>;
}

/// Request builder registered under a stable name.
pub type RequestBuilder = Arc<dyn Fn(&[Value]) -> Result<RequestSpec, QueueError> + Send + Sync>;

/// Named request builders.
///
/// A durable operation created from a handler stores the handler's name and
/// its arguments instead of only the built request. After a restart (or after
/// a placeholder in the arguments resolves) the request is rebuilt by calling
/// the handler again, so builders must be registered before `boot()`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RequestBuilder>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("HandlerRegistry").field("names", &names).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the builder for `name`.
    pub fn register<F>(&self, name: impl Into<String>, builder: F)
    where
        F: Fn(&[Value]) -> Result<RequestSpec, QueueError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Arc::new(builder));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Build a request by calling the named builder.
    pub fn build(&self, name: &str, args: &[Value]) -> Result<RequestSpec, QueueError> {
        let builder = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownHandler(name.to_string()))?;
        builder(args)
    }
}

/// What to send: a ready request, or a named builder plus its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Spec(RequestSpec),
    Handler { name: String, args: Vec<Value> },
}

impl Request {
    pub fn handler(name: impl Into<String>, args: Vec<Value>) -> Self {
        Request::Handler {
            name: name.into(),
            args,
        }
    }
}

impl From<RequestSpec> for Request {
    fn from(spec: RequestSpec) -> Self {
        Request::Spec(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_calls_registered_handler() {
        let registry = HandlerRegistry::new();
        registry.register("complete_todo", |args| {
            let id = args
                .first()
                .ok_or_else(|| QueueError::validation("missing id"))?;
            let id = id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string());
            Ok(RequestSpec::new("PUT", format!("/todos/{id}/done"), Value::Null))
        });

        assert!(registry.contains("complete_todo"));
        let spec = registry.build("complete_todo", &[json!(12)]).unwrap();
        assert_eq!(spec.target, "/todos/12/done");

        assert!(matches!(registry.build("complete_todo", &[]), Err(QueueError::ValidationFailure(_))));
        assert_eq!(
            registry.build("missing", &[]),
            Err(QueueError::UnknownHandler("missing".to_string()))
        );
    }
}
