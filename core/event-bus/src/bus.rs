//! Core event bus implementation
//!
//! Topic registry, subscription lifecycle and the publish/dispatch engine.
//! Sequence numbers and timestamps are assigned under the queue lock — the
//! single point where global order is fixed. With the default single
//! dispatch worker, every subscriber observes the events it matches in
//! exactly that order.

use crate::config::{BusConfig, DispatchMode, OverflowPolicy};
use crate::error::BusError;
use crate::events::{Event, Payload};
use crate::topic;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique handle for one subscription, valid for the life of the bus.
pub type SubscriptionId = Uuid;

/// Subscriber callback. The bus never assumes a handler is failure-free:
/// both `Err` returns and panics are caught, counted and logged without
/// affecting sibling subscribers or later events.
pub type SubscriberFn = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: SubscriberFn,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub dispatched: u64,
    pub errors: u64,
    pub dropped: u64,
    pub queue_depth: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

struct QueueState {
    next_sequence: u64,
    items: VecDeque<Event>,
}

struct BusInner {
    config: BusConfig,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    queue: Mutex<QueueState>,
    /// Wakes dispatch workers after an enqueue.
    queue_push: Notify,
    /// Wakes block-policy publishers and the drain waiter after a pop.
    queue_pop: Notify,
    counters: Counters,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BusInner {
    /// Assigns the next sequence number and timestamp. Caller must hold the
    /// queue lock; this is the sole ordering point.
    fn stamp_locked(&self, q: &mut QueueState, topic: String, payload: Payload) -> Event {
        let sequence = q.next_sequence;
        q.next_sequence += 1;
        Event {
            topic,
            payload,
            sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Delivers `event` to every subscription whose pattern matches.
    ///
    /// The matching snapshot is taken under the registry read lock; handlers
    /// run with no bus lock held, so a handler may subscribe or publish
    /// re-entrantly.
    fn dispatch(&self, event: &Event) {
        let matched: Vec<(SubscriptionId, SubscriberFn)> = {
            let subs = self.subscriptions.read();
            subs.values()
                .filter(|s| topic::matches(&event.topic, &s.pattern))
                .map(|s| (s.id, s.handler.clone()))
                .collect()
        };

        for (id, handler) in matched {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = %id,
                        topic = %event.topic,
                        "subscriber handler failed: {e:#}"
                    );
                }
                Err(_) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber = %id, topic = %event.topic, "subscriber handler panicked");
                }
            }
        }
    }
}

async fn worker_loop(inner: Arc<BusInner>, mut stop_rx: watch::Receiver<bool>, worker: usize) {
    debug!(worker, "dispatch worker started");
    loop {
        let popped = inner.queue.lock().items.pop_front();
        match popped {
            Some(event) => {
                inner.queue_pop.notify_waiters();
                inner.dispatch(&event);
            }
            None => {
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = inner.queue_push.notified() => {}
                    _ = stop_rx.changed() => {}
                }
            }
        }
    }
    debug!(worker, "dispatch worker stopped");
}

/// Topic-based pub/sub bus.
///
/// Cheap to clone; all clones share the same registry, queue and counters.
/// Construct inside a tokio runtime — dispatch workers are spawned
/// immediately.
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl EventBus {
    /// Bus with the default configuration (queued, single worker).
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let inner = Arc::new(BusInner {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            queue: Mutex::new(QueueState { next_sequence: 1, items: VecDeque::new() }),
            queue_push: Notify::new(),
            queue_pop: Notify::new(),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            stop_tx,
            workers: Mutex::new(Vec::new()),
        });

        let worker_count = inner.config.workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let worker_inner = inner.clone();
            let stop_rx = inner.stop_tx.subscribe();
            handles.push(tokio::spawn(worker_loop(worker_inner, stop_rx, worker)));
        }
        *inner.workers.lock() = handles;

        info!(
            workers = worker_count,
            capacity = inner.config.queue_capacity,
            "event bus started"
        );
        Self { inner }
    }

    /// Registers a handler for every topic matching `pattern`. Exact topics
    /// are just patterns without wildcard segments.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        topic::validate_pattern(pattern)?;

        let id = Uuid::new_v4();
        let subscription = Subscription {
            id,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
            created_at: Utc::now(),
        };
        self.inner.subscriptions.write().insert(id, subscription);
        debug!(subscriber = %id, pattern, "subscribed");
        Ok(id)
    }

    /// Removes a subscription. Returns false for an unknown id. Safe while
    /// a dispatch is in flight: that dispatch already holds its snapshot.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.write().remove(&id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Publishes with the configured default dispatch mode.
    pub async fn publish(&self, topic: &str, payload: Payload) -> Result<Event, BusError> {
        self.publish_with_mode(topic, payload, self.inner.config.mode).await
    }

    pub async fn publish_with_mode(
        &self,
        topic: &str,
        payload: Payload,
        mode: DispatchMode,
    ) -> Result<Event, BusError> {
        match mode {
            DispatchMode::Sync => self.publish_sync(topic, payload),
            DispatchMode::Queued => self.enqueue(topic, payload).await,
        }
    }

    /// Publishes and dispatches on the caller's thread before returning.
    /// Never waits, so it is callable from inside a subscriber handler.
    pub fn publish_sync(&self, topic: &str, payload: Payload) -> Result<Event, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        topic::validate_topic(topic)?;

        let event = {
            let mut q = self.inner.queue.lock();
            self.inner.stamp_locked(&mut q, topic.to_string(), payload)
        };
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.dispatch(&event);
        Ok(event)
    }

    /// Queued publish that never waits. Under the block policy a full queue
    /// fails immediately; under drop-oldest it behaves like `publish`.
    pub fn try_publish(&self, topic: &str, payload: Payload) -> Result<Event, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        topic::validate_topic(topic)?;

        let mut q = self.inner.queue.lock();
        if q.items.len() >= self.inner.config.queue_capacity {
            match self.inner.config.overflow {
                OverflowPolicy::DropOldest => {
                    q.items.pop_front();
                    self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(topic, "queue full, dropped oldest event");
                }
                OverflowPolicy::Block => {
                    return Err(BusError::QueueFull { waited_ms: 0 });
                }
            }
        }
        let event = self.inner.stamp_locked(&mut q, topic.to_string(), payload);
        q.items.push_back(event.clone());
        drop(q);
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.queue_push.notify_one();
        Ok(event)
    }

    async fn enqueue(&self, topic: &str, payload: Payload) -> Result<Event, BusError> {
        topic::validate_topic(topic)?;
        let deadline = tokio::time::Instant::now() + self.inner.config.block_timeout();
        let mut pending = Some(payload);

        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(BusError::Closed);
            }

            // Register for pop notifications before checking capacity, so a
            // pop between the check and the wait is not missed. notify_waiters
            // stores no permit, so the future must be enabled before the
            // check, not merely created.
            let notified = self.inner.queue_pop.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut q = self.inner.queue.lock();
                let full = q.items.len() >= self.inner.config.queue_capacity;
                let drop_oldest =
                    full && self.inner.config.overflow == OverflowPolicy::DropOldest;
                if !full || drop_oldest {
                    if drop_oldest {
                        q.items.pop_front();
                        self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(topic, "queue full, dropped oldest event");
                    }
                    if let Some(payload) = pending.take() {
                        let event = self.inner.stamp_locked(&mut q, topic.to_string(), payload);
                        q.items.push_back(event.clone());
                        drop(q);
                        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
                        self.inner.queue_push.notify_one();
                        return Ok(event);
                    }
                }
            }

            // Block policy: wait for space up to the configured bound.
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BusError::QueueFull {
                    waited_ms: self.inner.config.block_timeout_ms,
                });
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.counters.published.load(Ordering::Relaxed),
            dispatched: self.inner.counters.dispatched.load(Ordering::Relaxed),
            errors: self.inner.counters.errors.load(Ordering::Relaxed),
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
            queue_depth: self.inner.queue.lock().items.len(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Closes the bus: new publishes and subscriptions are rejected, the
    /// queue is drained for up to `drain_timeout`, workers are joined, and
    /// anything still undelivered is discarded and counted as dropped.
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = tokio::time::Instant::now() + drain_timeout;

        loop {
            let notified = self.inner.queue_pop.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.queue.lock().items.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("drain timeout, discarding undelivered events");
                break;
            }
        }

        let _ = self.inner.stop_tx.send(true);
        self.inner.queue_push.notify_waiters();
        self.inner.queue_pop.notify_waiters();

        // Workers exit promptly once signalled; grant a small grace period
        // even when the drain consumed the whole budget.
        let join_deadline = std::cmp::max(
            deadline,
            tokio::time::Instant::now() + Duration::from_millis(100),
        );
        let handles: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout_at(join_deadline, handle).await.is_err() {
                warn!("dispatch worker did not stop in time, leaking it");
            }
        }

        let leftover = {
            let mut q = self.inner.queue.lock();
            let n = q.items.len();
            q.items.clear();
            n
        };
        if leftover > 0 {
            self.inner
                .counters
                .dropped
                .fetch_add(leftover as u64, Ordering::Relaxed);
        }
        info!(dropped = leftover, "event bus shut down");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Process-wide default instance (explicit init / teardown)
// ============================================================================

static DEFAULT_BUS: Mutex<Option<EventBus>> = Mutex::new(None);

/// Installs a process-wide default bus. Fails if one is already installed;
/// there is no implicit lazy creation.
pub fn init_default_bus(config: BusConfig) -> Result<EventBus, BusError> {
    let mut slot = DEFAULT_BUS.lock();
    if slot.is_some() {
        return Err(BusError::DefaultBusAlreadyInitialized);
    }
    let bus = EventBus::with_config(config);
    *slot = Some(bus.clone());
    Ok(bus)
}

/// The installed default bus, if any.
pub fn default_bus() -> Option<EventBus> {
    DEFAULT_BUS.lock().clone()
}

/// Removes and shuts down the default bus.
pub async fn shutdown_default_bus(drain_timeout: Duration) -> Result<(), BusError> {
    let bus = DEFAULT_BUS
        .lock()
        .take()
        .ok_or(BusError::DefaultBusNotInitialized)?;
    bus.shutdown(drain_timeout).await;
    Ok(())
}
