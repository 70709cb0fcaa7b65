//! `SilentQueue` runtime: submission, lookup, removal and placeholders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

use silentq_core::{
    Behavior, DeferredField, OperationId, PlaceholderToken, QueueError, QueueResult, set_pointer,
};
use silentq_events::{
    EventBus, EventHub, InMemoryEventBus, OperationSnapshot, PushEvent, QueueStateChange,
    QueueStatus, StateChange, Subscription,
};

use crate::config::{QueueConfig, SubmitOptions};
use crate::operation::{
    Completion, FallbackContext, QueuedOperation, Submission, remove_advisory, save_advisory,
};
use crate::placeholder::PlaceholderRegistry;
use crate::queue::{QueueRegistry, Queues, scheduler};
use crate::storage::{InMemoryStorage, PersistenceAdapter, SerializedOperation, SqliteStorage};
use crate::transport::{HandlerRegistry, Request, Transport};

/// State shared between the facade and the queue workers.
pub(crate) struct Shared {
    pub(crate) config: QueueConfig,
    pub(crate) storage: Arc<dyn PersistenceAdapter>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) state_bus: Arc<InMemoryEventBus<QueueStateChange>>,
    pub(crate) queues: QueueRegistry,
    pub(crate) placeholders: PlaceholderRegistry,
    statuses: Mutex<HashMap<String, QueueStatus>>,
    pub(crate) boot_started: AtomicBool,
    pub(crate) booted: AtomicBool,
    pub(crate) workers_enabled: AtomicBool,
    submit_gate: tokio::sync::Mutex<()>,
    pub(crate) sequence: AtomicU64,
}

impl Shared {
    pub(crate) async fn save(&self, queue: &str, op: &SerializedOperation) {
        save_advisory(self.storage.as_ref(), &self.hub, queue, op).await;
    }

    pub(crate) async fn unpersist(&self, queue: &str, id: OperationId) {
        remove_advisory(self.storage.as_ref(), &self.hub, queue, id).await;
    }

    /// Save an operation that was already queued when `op` was taken.
    ///
    /// If it finished or was removed while the save was in progress, the
    /// stored copy is deleted again so a finished operation is never
    /// replayed at the next boot.
    pub(crate) async fn save_queued(&self, queue: &str, op: &SerializedOperation) {
        self.save(queue, op).await;
        let gone = self.booted.load(Ordering::Acquire) && self.queues.lock().locate(op.id).is_none();
        if gone {
            tracing::debug!(queue, operation_id = %op.id, "operation left the queue during save");
            self.unpersist(queue, op.id).await;
        }
    }

    /// Record a state change and, if enabled, publish it on the state bus.
    pub(crate) fn publish(&self, queue: &str, change: StateChange) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue.to_string())
            .or_default()
            .apply(&change);

        if self.config.state_events && !self.state_bus.is_closed() {
            let message = QueueStateChange {
                queue: queue.to_string(),
                change,
            };
            if let Err(err) = self.state_bus.publish(message) {
                tracing::warn!(queue, error = ?err, "failed to publish queue state change");
            }
        }
    }

    pub(crate) fn status(&self, queue: &str) -> QueueStatus {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Spawn a worker for `queue` unless one is running or workers are paused.
    pub(crate) fn ensure_worker(self: &Arc<Self>, queues: &mut Queues, queue: &str) {
        if !self.workers_enabled.load(Ordering::Acquire) {
            return;
        }
        let slot = queues.slot_mut(queue);
        if slot.worker.is_none() && !slot.ops.is_empty() {
            slot.worker = Some(tokio::spawn(scheduler::run_queue(self.clone(), queue.to_string())));
        }
    }

    /// Enable workers and start one for every non-empty queue.
    pub(crate) fn start_workers(self: &Arc<Self>) {
        self.workers_enabled.store(true, Ordering::Release);
        let mut queues = self.queues.lock();
        let names: Vec<String> = queues
            .slots_mut()
            .filter(|(_, slot)| !slot.ops.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.ensure_worker(&mut queues, &name);
        }
    }

    /// Resolve `token` and substitute it into every waiting operation.
    pub(crate) async fn resolve(&self, token: PlaceholderToken, value: Value) -> QueueResult<()> {
        let updated: Vec<(String, SerializedOperation)> = {
            let mut table = self.placeholders.lock();
            let referrers = table.begin_resolve(token, value.clone())?;
            let mut queues = self.queues.lock();
            referrers
                .into_iter()
                .filter_map(|id| {
                    let op = queues.find_mut(id)?;
                    op.apply_resolution(token, &value, &self.handlers);
                    op.durable.then(|| (op.queue.clone(), op.to_serialized()))
                })
                .collect()
        };

        tracing::debug!(token = %token, updated = updated.len(), "placeholder resolved");
        for (queue, op) in &updated {
            self.save_queued(queue, op).await;
        }
        Ok(())
    }

    /// Bind placeholders and append `op` to its queue.
    ///
    /// Returns the pushed snapshot and, if binding substituted anything, the
    /// serialized form to store again.
    fn enqueue(self: &Arc<Self>, mut op: QueuedOperation) -> (OperationSnapshot, Option<SerializedOperation>) {
        let queue = op.queue.clone();
        let mut table = self.placeholders.lock();
        let refs = op.placeholder_refs.clone();
        let resolved = table.bind(op.id, &refs);
        let changed = !resolved.is_empty();
        for (token, value) in resolved {
            op.apply_resolution(token, &value, &self.handlers);
        }

        let snapshot = op.snapshot();
        let resave = (changed && op.durable).then(|| op.to_serialized());

        let contents = {
            let mut queues = self.queues.lock();
            let slot = queues.slot_mut(&queue);
            slot.ops.push_back(op);
            let contents = slot.contents();
            self.ensure_worker(&mut queues, &queue);
            contents
        };
        drop(table);

        self.publish(&queue, StateChange::Contents(contents));
        (snapshot, resave)
    }
}

/// Builder for [`SilentQueue`].
pub struct SilentQueueBuilder {
    transport: Arc<dyn Transport>,
    storage: Option<Arc<dyn PersistenceAdapter>>,
    config: QueueConfig,
    handlers: Option<Arc<HandlerRegistry>>,
    hub: Option<Arc<EventHub>>,
}

impl SilentQueueBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn PersistenceAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use SQLite at `config.database_path` (or the OS data dir).
    pub fn sqlite_storage(self) -> anyhow::Result<Self> {
        let path = self.config.resolve_database_path()?;
        Ok(self.storage(Arc::new(SqliteStorage::new(path))))
    }

    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn build(self) -> SilentQueue {
        let storage: Arc<dyn PersistenceAdapter> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(InMemoryStorage::new()),
        };
        let shared = Shared {
            config: self.config,
            storage,
            transport: self.transport,
            handlers: self.handlers.unwrap_or_default(),
            hub: self.hub.unwrap_or_default(),
            state_bus: Arc::new(InMemoryEventBus::new()),
            queues: QueueRegistry::new(),
            placeholders: PlaceholderRegistry::new(),
            statuses: Mutex::new(HashMap::new()),
            boot_started: AtomicBool::new(false),
            booted: AtomicBool::new(false),
            workers_enabled: AtomicBool::new(false),
            submit_gate: tokio::sync::Mutex::new(()),
            sequence: AtomicU64::new(1),
        };
        SilentQueue {
            shared: Arc::new(shared),
        }
    }
}

/// Silent submission queue runtime.
///
/// Cheap to clone; clones share queues, storage and the event hub.
/// Call [`boot`](Self::boot) once before submitting.
#[derive(Clone)]
pub struct SilentQueue {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for SilentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SilentQueue")
            .field("booted", &self.is_booted())
            .field("queues", &self.queue_names())
            .finish_non_exhaustive()
    }
}

impl SilentQueue {
    pub fn builder(transport: Arc<dyn Transport>) -> SilentQueueBuilder {
        SilentQueueBuilder {
            transport,
            storage: None,
            config: QueueConfig::default(),
            handlers: None,
            hub: None,
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.shared.hub
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.shared.handlers
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Subscribe to loading / contents / last-error changes of every queue.
    /// The stream disconnects after [`shutdown`](Self::shutdown).
    pub fn state_changes(&self) -> Subscription<QueueStateChange> {
        self.shared.state_bus.subscribe()
    }

    pub fn is_booted(&self) -> bool {
        self.shared.booted.load(Ordering::Acquire)
    }

    /// Enqueue an operation.
    ///
    /// `Silent` submissions return at once with the virtual response; their
    /// outcome is reported only through the hub and fallback handlers.
    /// `Queued` submissions carry a [`Completion`] for the real outcome.
    pub async fn submit(
        &self,
        request: impl Into<Request>,
        options: SubmitOptions,
    ) -> QueueResult<Submission> {
        let shared = &self.shared;
        if !self.is_booted() {
            return Err(QueueError::NotBooted);
        }

        let retry = options
            .retry
            .clone()
            .unwrap_or_else(|| shared.config.default_retry.clone());
        retry.validate()?;

        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| shared.config.default_queue.clone());
        if queue.trim().is_empty() {
            return Err(QueueError::invalid_config("queue name must not be empty"));
        }

        let durable = options.resolved_durable();
        let SubmitOptions {
            behavior,
            fallback,
            on_retry,
            virtual_response,
            deferred_fields,
            linked_state,
            ..
        } = options;

        let mut op = match request.into() {
            Request::Spec(spec) => QueuedOperation::create(spec, behavior, retry, durable),
            Request::Handler { name, args } => {
                let spec = shared.handlers.build(&name, &args)?;
                QueuedOperation::create(spec, behavior, retry, durable).with_handler(name, args)
            }
        };

        let _gate = shared.submit_gate.lock().await;

        op.queue = queue.clone();
        op.sequence = shared.sequence.fetch_add(1, Ordering::AcqRel);
        op.linked_state = linked_state;
        op.fallback_handlers = fallback;
        op.retry_handlers = on_retry;

        let mut virtual_response = virtual_response;
        let mut placeholders = Vec::with_capacity(deferred_fields.len());
        {
            let mut table = shared.placeholders.lock();
            let already = table.resolved_among(&op.placeholder_refs)?;
            for (token, value) in already {
                op.apply_resolution(token, &value, &shared.handlers);
            }

            for pointer in deferred_fields {
                let token = table.allocate(Some(op.id));
                if !set_pointer(&mut virtual_response, &pointer, token.to_value()) {
                    tracing::warn!(operation_id = %op.id, pointer = %pointer, "cannot place deferred field in virtual response");
                }
                placeholders.push(DeferredField { pointer, token });
            }
        }
        op.produces = placeholders.clone();

        let completion = match behavior {
            Behavior::Queued => {
                let (tx, rx) = oneshot::channel();
                op.completion = Some(tx);
                Some(Completion::new(op.id, rx))
            }
            Behavior::Silent => None,
        };

        let id = op.id;
        shared.hub.emit_before_push(&PushEvent {
            operation: op.snapshot(),
        });
        if op.durable {
            shared.save(&queue, &op.to_serialized()).await;
        }

        let (snapshot, resave) = shared.enqueue(op);
        if let Some(stored) = resave {
            shared.save_queued(&queue, &stored).await;
        }

        tracing::debug!(queue = %queue, operation_id = %id, behavior = behavior.as_str(), "operation queued");
        shared.hub.emit_pushed(&PushEvent { operation: snapshot });

        Ok(Submission {
            id,
            queue,
            behavior,
            virtual_response,
            placeholders,
            completion,
        })
    }

    /// Remove an operation from its queue and from storage.
    ///
    /// An in-flight send is cancelled and fallback handlers do not run.
    /// Returns `false` if the operation is not (or no longer) queued; calling
    /// it again is a no-op.
    pub async fn remove(&self, id: OperationId) -> bool {
        let shared = &self.shared;
        let removed = {
            let mut queues = shared.queues.lock();
            let Some(queue) = queues.locate(id) else {
                return false;
            };
            let slot = queues.slot_mut(&queue);
            if let Some(in_flight) = slot.in_flight.as_mut().filter(|f| f.id == id) {
                in_flight.removed = true;
                in_flight.cancel.cancel();
            }
            slot.position(id)
                .and_then(|pos| slot.ops.remove(pos))
                .map(|op| (op, slot.contents()))
        };
        let Some((op, contents)) = removed else {
            return false;
        };

        {
            let mut table = shared.placeholders.lock();
            table.release(op.id, &op.placeholder_refs);
            table.orphan(op.produced_tokens());
        }
        op.remove_persisted(shared.storage.as_ref(), &shared.hub).await;

        tracing::info!(queue = %op.queue, operation_id = %id, "operation removed");
        shared.publish(&op.queue, StateChange::Contents(contents));
        // Dropping `op` drops its completion; a waiter observes `Removed`.
        true
    }

    /// Cancel the in-flight send of `id`. The cancelled attempt counts as a
    /// failed attempt. Returns `false` unless `id` is currently sending.
    pub fn abort(&self, id: OperationId) -> bool {
        let queues = self.shared.queues.lock();
        let Some(queue) = queues.locate(id) else {
            return false;
        };
        match queues.slot(&queue).and_then(|slot| slot.in_flight.as_ref()) {
            Some(in_flight) if in_flight.id == id && in_flight.executing => {
                in_flight.cancel.cancel();
                tracing::debug!(queue = %queue, operation_id = %id, "send aborted");
                true
            }
            _ => false,
        }
    }

    /// Install a fresh completion on a `Queued` operation, typically one
    /// rehydrated at boot. A previous waiter observes `Removed`.
    pub fn reattach(&self, id: OperationId) -> Option<Completion> {
        let mut queues = self.shared.queues.lock();
        let op = queues.find_mut(id)?;
        if op.behavior != Behavior::Queued {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        op.completion = Some(tx);
        Some(Completion::new(id, rx))
    }

    /// Append a fallback handler to a queued operation.
    pub fn attach_fallback<F>(&self, id: OperationId, handler: F) -> bool
    where
        F: Fn(&FallbackContext) + Send + Sync + 'static,
    {
        let mut queues = self.shared.queues.lock();
        match queues.find_mut(id) {
            Some(op) => {
                op.fallback_handlers.push(Arc::new(handler));
                true
            }
            None => false,
        }
    }

    pub fn get_operation(&self, id: OperationId) -> Option<OperationSnapshot> {
        self.shared.queues.get(id)
    }

    pub fn filter_operations<F>(&self, queue: &str, predicate: F) -> Vec<OperationSnapshot>
    where
        F: Fn(&OperationSnapshot) -> bool,
    {
        self.shared.queues.filter(queue, predicate)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.shared.queues.queue_names()
    }

    pub fn status(&self, queue: &str) -> QueueStatus {
        self.shared.status(queue)
    }

    /// Allocate a token the application resolves itself.
    pub fn allocate_placeholder(&self) -> PlaceholderToken {
        self.shared.placeholders.allocate()
    }

    /// Resolve `token`; fails with `AlreadyResolved` on repeat calls.
    pub async fn resolve_placeholder(&self, token: PlaceholderToken, value: Value) -> QueueResult<()> {
        self.shared.resolve(token, value).await
    }

    pub fn placeholder_value(&self, token: &PlaceholderToken) -> Option<Value> {
        self.shared.placeholders.resolved_value(token)
    }

    pub fn stringify(&self, value: &Value) -> String {
        silentq_core::stringify(value)
    }

    pub fn dehydrate(&self, value: &Value) -> Value {
        self.shared.placeholders.dehydrate(value)
    }

    /// Stop all workers and drop the in-memory queues.
    ///
    /// Stored operations are left untouched. Pending `Queued` waiters observe
    /// `Removed`.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        shared.workers_enabled.store(false, Ordering::Release);
        shared.booted.store(false, Ordering::Release);

        let workers: Vec<_> = {
            let mut queues = shared.queues.lock();
            let workers = queues
                .slots_mut()
                .filter_map(|(_, slot)| {
                    if let Some(in_flight) = &slot.in_flight {
                        in_flight.cancel.cancel();
                    }
                    slot.worker.take()
                })
                .collect();
            queues.clear();
            workers
        };

        for worker in workers {
            worker.abort();
            let _ = worker.await;
        }
        shared.state_bus.close();
        tracing::info!("silent queue shut down");
    }
}
