//! Test doubles shared by the unit and scenario tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use silentq_core::{OperationId, RequestSpec, SendError};
use silentq_events::{CompleteEvent, EventHub};

use crate::storage::{InMemoryStorage, PersistenceAdapter, SerializedOperation, StorageError};
use crate::transport::Transport;

/// Transport whose answers are scripted per target.
///
/// Unscripted requests succeed with `{"ok": true, "echo": <body>}` while
/// online and fail transiently while offline.
pub(crate) struct ScriptedTransport {
    online: AtomicBool,
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, SendError>>>>,
    sent: Mutex<Vec<(Instant, RequestSpec)>>,
    latency: Mutex<Duration>,
}

impl ScriptedTransport {
    pub(crate) fn online() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            scripts: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    pub(crate) fn offline() -> Arc<Self> {
        let transport = Self::online();
        transport.set_online(false);
        transport
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub(crate) fn script(&self, target: &str, outcome: Result<Value, SendError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub(crate) fn sent(&self) -> Vec<RequestSpec> {
        self.sent.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub(crate) fn sent_targets(&self) -> Vec<String> {
        self.sent().into_iter().map(|r| r.target).collect()
    }

    pub(crate) fn send_times(&self) -> Vec<Instant> {
        self.sent.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &RequestSpec) -> Result<Value, SendError> {
        self.sent.lock().unwrap().push((Instant::now(), request.clone()));

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.target)
            .and_then(VecDeque::pop_front);
        if let Some(outcome) = scripted {
            return outcome;
        }

        if self.online.load(Ordering::SeqCst) {
            Ok(json!({"ok": true, "echo": request.body}))
        } else {
            Err(SendError::Transient("offline".to_string()))
        }
    }
}

/// Storage that can be switched into a failing mode or made slow to save.
#[derive(Default)]
pub(crate) struct FlakyStorage {
    pub(crate) inner: InMemoryStorage,
    failing: AtomicBool,
    save_delay: Mutex<Duration>,
}

impl FlakyStorage {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock().unwrap() = delay;
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Backend("disk unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceAdapter for FlakyStorage {
    async fn save(&self, queue: &str, op: &SerializedOperation) -> Result<(), StorageError> {
        self.check()?;
        let delay = *self.save_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.save(queue, op).await
    }

    async fn load(&self, queue: &str) -> Result<Vec<SerializedOperation>, StorageError> {
        self.check()?;
        self.inner.load(queue).await
    }

    async fn remove(&self, queue: &str, id: OperationId) -> Result<(), StorageError> {
        self.check()?;
        self.inner.remove(queue, id).await
    }

    async fn list_queues(&self) -> Result<BTreeSet<String>, StorageError> {
        self.check()?;
        self.inner.list_queues().await
    }
}

/// Forward every `complete` event into a channel.
pub(crate) fn completions(hub: &EventHub) -> mpsc::UnboundedReceiver<CompleteEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    hub.on_complete(move |event| {
        tx.send(event.clone())?;
        Ok(())
    });
    rx
}
