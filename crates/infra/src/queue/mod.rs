//! Named queues and their serial workers.

mod registry;
pub(crate) mod scheduler;

pub use registry::QueueRegistry;
pub(crate) use registry::{InFlight, Queues};
