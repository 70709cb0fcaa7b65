//! Silent submission queue runtime.
//!
//! Operations are acknowledged optimistically, queued per name, replayed
//! serially against a [`Transport`] with retry and backoff, and mirrored to a
//! [`PersistenceAdapter`] so they survive restarts.
//!
//! ```ignore
//! let queue = SilentQueue::builder(transport)
//!     .storage(Arc::new(SqliteStorage::at_default_location()?))
//!     .build();
//! queue.boot().await?;
//!
//! let created = queue
//!     .submit(RequestSpec::post("/todos", body), SubmitOptions::silent().defer("/id"))
//!     .await?;
//! ```

mod boot;
pub mod config;
pub mod operation;
pub mod placeholder;
pub mod queue;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use config::{ConfigError, QueueConfig, SubmitOptions, default_database_path};
pub use operation::{
    Completion, FallbackContext, FallbackHandler, OperationState, QueuedOperation, RetryContext,
    RetryHandler, Submission,
};
pub use placeholder::PlaceholderRegistry;
pub use queue::QueueRegistry;
pub use runtime::{SilentQueue, SilentQueueBuilder};
pub use storage::{
    InMemoryStorage, PersistenceAdapter, SerializedOperation, SqliteStorage, StorageError,
};
pub use transport::{HandlerRegistry, Request, RequestBuilder, Transport};

#[cfg(test)]
pub(crate) mod testing;
