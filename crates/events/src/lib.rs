//! `silentq-events`: process-wide notifications for the silent queue.
//!
//! Two independent surfaces live here:
//!
//! - [`EventHub`]: typed, multi-subscriber lifecycle callbacks
//!   (boot / push / success / error / fail / complete / persistence error).
//! - [`EventBus`]: a pub/sub stream of [`QueueStateChange`] messages that a UI
//!   binding layer can project into its own reactive primitives.

pub mod bus;
pub mod event;
pub mod hub;
pub mod in_memory_bus;
pub mod state;

pub use bus::{EventBus, Subscription};
pub use event::{
    BootEvent, CompleteEvent, ErrorEvent, FailEvent, OperationSnapshot, Outcome,
    PersistenceErrorEvent, PushEvent, StorageAction, SuccessEvent,
};
pub use hub::{EventHub, SubscriptionId};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use state::{QueueStateChange, QueueStatus, StateChange};
