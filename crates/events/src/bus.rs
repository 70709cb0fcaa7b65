//! State-change publishing/subscription abstraction (mechanics only).
//!
//! The queue runtime publishes discrete [`QueueStateChange`](crate::QueueStateChange)
//! messages (loading flag, queue contents, last error). A binding layer
//! subscribes and projects them into whatever reactive primitive it uses;
//! the runtime has no dependency in the other direction.
//!
//! ## Delivery
//!
//! - **Broadcast**: every subscription receives every message published after
//!   it subscribed.
//! - **Per-publisher ordering**: messages from one queue worker arrive in
//!   publication order. Messages from different queues may interleave.
//! - **Best effort**: a dropped subscription is pruned on the next publish.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a message stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let sub = queue.state_changes();
///
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(change) => status.apply(&change.change),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Bus closed
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub bus.
///
/// The trait requires `Send + Sync`; publishing happens from queue workers
/// running on the async runtime, so `publish` must never block.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
