//! Event Hub: process-wide lifecycle subscription points.
//!
//! Each event kind has its own ordered subscriber list. Emission calls every
//! subscriber in registration order; a subscriber that returns `Err` or panics
//! is logged and skipped, and the remaining subscribers still run.
//!
//! Subscribers are invoked outside the hub's locks, so a subscriber may
//! itself subscribe or unsubscribe.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::event::{
    BootEvent, CompleteEvent, ErrorEvent, FailEvent, PersistenceErrorEvent, PushEvent,
    SuccessEvent,
};

/// Handle returned by every `on_*` call; pass to [`EventHub::unsubscribe`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

struct Channel<E> {
    name: &'static str,
    subscribers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Channel<E> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, id: SubscriptionId, handler: Handler<E>) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    fn len(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns the number of subscribers that failed.
    fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<(SubscriptionId, Handler<E>)> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut failed = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    tracing::warn!(event = self.name, subscription = id.0, error = %err, "event subscriber failed");
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(event = self.name, subscription = id.0, "event subscriber panicked");
                }
            }
        }
        failed
    }
}

/// Multi-subscriber lifecycle notifications.
pub struct EventHub {
    next_id: AtomicU64,
    boot: Channel<BootEvent>,
    before_push: Channel<PushEvent>,
    pushed: Channel<PushEvent>,
    success: Channel<SuccessEvent>,
    error: Channel<ErrorEvent>,
    fail: Channel<FailEvent>,
    complete: Channel<CompleteEvent>,
    persistence_error: Channel<PersistenceErrorEvent>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("boot", &self.boot.len())
            .field("success", &self.success.len())
            .field("error", &self.error.len())
            .field("complete", &self.complete.len())
            .finish_non_exhaustive()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! channel_api {
    ($on:ident, $emit:ident, $field:ident, $event:ty) => {
        pub fn $on<F>(&self, handler: F) -> SubscriptionId
        where
            F: Fn(&$event) -> anyhow::Result<()> + Send + Sync + 'static,
        {
            let id = self.next_id();
            self.$field.push(id, Arc::new(handler));
            id
        }

        pub fn $emit(&self, event: &$event) -> usize {
            self.$field.emit(event)
        }
    };
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            boot: Channel::new("boot"),
            before_push: Channel::new("before_push"),
            pushed: Channel::new("pushed"),
            success: Channel::new("success"),
            error: Channel::new("error"),
            fail: Channel::new("fail"),
            complete: Channel::new("complete"),
            persistence_error: Channel::new("persistence_error"),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    channel_api!(on_boot, emit_boot, boot, BootEvent);
    channel_api!(on_before_push, emit_before_push, before_push, PushEvent);
    channel_api!(on_pushed, emit_pushed, pushed, PushEvent);
    channel_api!(on_success, emit_success, success, SuccessEvent);
    channel_api!(on_error, emit_error, error, ErrorEvent);
    channel_api!(on_fail, emit_fail, fail, FailEvent);
    channel_api!(on_complete, emit_complete, complete, CompleteEvent);
    channel_api!(
        on_persistence_error,
        emit_persistence_error,
        persistence_error,
        PersistenceErrorEvent
    );

    /// Remove a subscriber from whichever list holds it.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.boot.remove(id)
            || self.before_push.remove(id)
            || self.pushed.remove(id)
            || self.success.remove(id)
            || self.error.remove(id)
            || self.fail.remove(id)
            || self.complete.remove(id)
            || self.persistence_error.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_event() -> BootEvent {
        BootEvent {
            restored: vec![("q1".to_string(), 3)],
        }
    }

    #[test]
    fn subscribers_fire_in_registration_order() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            hub.on_boot(move |_| {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }

        assert_eq!(hub.emit_boot(&boot_event()), 0);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_subscriber_does_not_stop_the_rest() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        hub.on_boot(move |_| {
            s.lock().unwrap().push("first");
            Ok(())
        });
        hub.on_boot(|_| anyhow::bail!("subscriber broke"));
        hub.on_boot(|_| panic!("subscriber panicked"));
        let s = seen.clone();
        hub.on_boot(move |_| {
            s.lock().unwrap().push("last");
            Ok(())
        });

        assert_eq!(hub.emit_boot(&boot_event()), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "last"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let hub = EventHub::new();
        let hits = Arc::new(AtomicU64::new(0));

        let h = hits.clone();
        let keep = hub.on_boot(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let h = hits.clone();
        let gone = hub.on_boot(move |_| {
            h.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        assert!(hub.unsubscribe(gone));
        assert!(!hub.unsubscribe(gone));
        hub.emit_boot(&boot_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_ne!(keep, gone);
    }

    #[test]
    fn subscriber_may_subscribe_during_emit() {
        let hub = Arc::new(EventHub::new());
        let inner = hub.clone();
        hub.on_boot(move |_| {
            inner.on_boot(|_| Ok(()));
            Ok(())
        });

        hub.emit_boot(&boot_event());
        assert_eq!(hub.boot.len(), 2);
    }
}
