//! `silentq-core`: building blocks shared by the queue runtime.
//!
//! This crate contains **pure** primitives (no IO, no async): identifiers,
//! the error taxonomy, retry policy, the request descriptor, and the
//! placeholder value codec.

pub mod error;
pub mod id;
pub mod placeholder;
pub mod policy;
pub mod request;

pub use error::{QueueError, QueueResult, SendError};
pub use id::{OperationId, PlaceholderToken};
pub use placeholder::{
    DeferredField, TOKEN_KEY, collect_request_tokens, collect_tokens, dehydrate_with, set_pointer, stringify,
    substitute, substitute_request,
};
pub use policy::{Backoff, BackoffStrategy, Behavior, RetryPolicy};
pub use request::RequestSpec;
