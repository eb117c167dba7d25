//! Publisher harness
//!
//! Owns a set of independently timed repeating loops, each producing events
//! it hands to the shared [`EventBus`]. One spawned task per enabled loop;
//! the wait between iterations is interruptible, so `stop` returns promptly
//! regardless of how long an interval is.

use crate::bus::{BusStats, EventBus};
use crate::error::BusError;
use crate::events::{Event, Payload};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Uppercases and trims a symbol so `btc-usdt` and `BTC-USDT` are one entry.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Thread-safe symbol list. Loops read a copied snapshot at iteration start,
/// so mutations take effect on the next iteration, never mid-iteration.
#[derive(Default)]
pub struct SymbolList {
    inner: RwLock<Vec<String>>,
}

impl SymbolList {
    pub fn new(symbols: impl IntoIterator<Item = String>) -> Self {
        let list = Self::default();
        for s in symbols {
            list.add(&s);
        }
        list
    }

    /// Consistent copy of the current list.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.read().clone()
    }

    /// Returns false when the symbol was already present.
    pub fn add(&self, symbol: &str) -> bool {
        let normalized = normalize_symbol(symbol);
        if normalized.is_empty() {
            return false;
        }
        let mut inner = self.inner.write();
        if inner.contains(&normalized) {
            return false;
        }
        inner.push(normalized);
        true
    }

    /// Returns false when the symbol was not present.
    pub fn remove(&self, symbol: &str) -> bool {
        let normalized = normalize_symbol(symbol);
        let mut inner = self.inner.write();
        match inner.iter().position(|s| *s == normalized) {
            Some(idx) => {
                inner.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[derive(Default)]
struct LoopStats {
    published: AtomicU64,
    errors: AtomicU64,
    last_run_ms: AtomicI64,
}

/// Per-loop statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LoopSnapshot {
    pub name: String,
    pub published: u64,
    pub errors: u64,
    pub last_run_ms: i64,
}

/// Merged harness + bus statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PublisherStats {
    pub publisher: String,
    pub loops: Vec<LoopSnapshot>,
    pub symbols: Vec<String>,
    pub bus: BusStats,
}

/// Work function of one loop. Returns how many events the iteration
/// published; an `Err` (or panic) counts against the loop and the loop
/// continues with its next scheduled run.
pub type WorkFn =
    Arc<dyn Fn() -> futures_util::future::BoxFuture<'static, anyhow::Result<u64>> + Send + Sync>;

/// One independently scheduled repeating task.
#[derive(Clone)]
pub struct LoopDef {
    pub name: String,
    pub interval: Duration,
    pub enabled: bool,
    work: WorkFn,
    stats: Arc<LoopStats>,
}

impl LoopDef {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<u64>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            enabled: true,
            work: Arc::new(move || work().boxed()),
            stats: Arc::new(LoopStats::default()),
        }
    }

    /// Disabled loops are skipped by `start`.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

async fn run_loop(def: LoopDef, mut stop_rx: watch::Receiver<bool>) {
    debug!(loop_name = %def.name, interval_ms = def.interval.as_millis() as u64, "loop started");
    loop {
        let started = tokio::time::Instant::now();
        match AssertUnwindSafe((def.work)()).catch_unwind().await {
            Ok(Ok(published)) => {
                def.stats.published.fetch_add(published, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                def.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(loop_name = %def.name, "iteration failed: {e:#}");
            }
            Err(_) => {
                def.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(loop_name = %def.name, "iteration panicked");
            }
        }
        def.stats
            .last_run_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        // Stop signalled during the iteration: finish it, skip the wait.
        if *stop_rx.borrow_and_update() {
            break;
        }
        let wait = def.interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop_rx.changed() => break,
        }
    }
    debug!(loop_name = %def.name, "loop stopped");
}

/// Scheduler that owns a publisher's loops, symbol list and stats.
pub struct PublisherHarness {
    name: String,
    bus: EventBus,
    loops: Mutex<Vec<LoopDef>>,
    symbols: Arc<SymbolList>,
    running: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    /// Last successful update per `{loop}.{key}`, epoch milliseconds.
    last_update: DashMap<String, i64>,
    /// Error count per `{loop}.{key}`.
    error_counts: DashMap<String, u64>,
}

impl PublisherHarness {
    pub fn new(name: impl Into<String>, bus: EventBus) -> Self {
        Self::with_symbols(name, bus, Vec::new())
    }

    pub fn with_symbols(name: impl Into<String>, bus: EventBus, symbols: Vec<String>) -> Self {
        Self {
            name: name.into(),
            bus,
            loops: Mutex::new(Vec::new()),
            symbols: Arc::new(SymbolList::new(symbols)),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            last_update: DashMap::new(),
            error_counts: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Shared symbol list; loop closures capture a clone of this handle.
    pub fn symbols(&self) -> Arc<SymbolList> {
        self.symbols.clone()
    }

    /// Registers a loop. Takes effect at the next `start`.
    pub fn add_loop(&self, def: LoopDef) {
        self.loops.lock().push(def);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns one task per enabled loop. No-op when already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(publisher = %self.name, "already running");
            return;
        }
        let (stop_tx, _) = watch::channel(false);
        let defs: Vec<LoopDef> = self
            .loops
            .lock()
            .iter()
            .filter(|d| d.enabled)
            .cloned()
            .collect();

        let mut handles = Vec::with_capacity(defs.len());
        for def in defs {
            let stop_rx = stop_tx.subscribe();
            let loop_name = def.name.clone();
            handles.push((loop_name, tokio::spawn(run_loop(def, stop_rx))));
        }
        info!(publisher = %self.name, loops = handles.len(), "publisher started");
        *self.handles.lock() = handles;
        *self.stop_tx.lock() = Some(stop_tx);
    }

    /// Signals every loop to exit, wakes their waits and joins each task
    /// within `timeout`. A task that does not join in time is logged and
    /// leaked, not escalated. Idempotent.
    pub async fn stop(&self, timeout: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(true);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let handles: Vec<(String, JoinHandle<()>)> = self.handles.lock().drain(..).collect();
        for (loop_name, handle) in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!(publisher = %self.name, loop_name = %loop_name, "loop did not stop within timeout, leaking it");
            }
        }
        info!(publisher = %self.name, "publisher stopped");
    }

    /// Adds a symbol; visible to loops from their next iteration.
    pub fn add_symbol(&self, symbol: &str) -> bool {
        let added = self.symbols.add(symbol);
        if added {
            info!(publisher = %self.name, symbol = %normalize_symbol(symbol), "symbol added");
        }
        added
    }

    /// Removes a symbol; excluded from the next iteration onward.
    pub fn remove_symbol(&self, symbol: &str) -> bool {
        let removed = self.symbols.remove(symbol);
        if removed {
            info!(publisher = %self.name, symbol = %normalize_symbol(symbol), "symbol removed");
        }
        removed
    }

    /// Records a successful fetch for `{loop}.{key}` bookkeeping.
    pub fn mark_update(&self, key: &str) {
        self.last_update
            .insert(key.to_string(), Utc::now().timestamp_millis());
    }

    /// Records a failed fetch for `{loop}.{key}`; the caller logs and skips.
    pub fn mark_error(&self, key: &str) {
        *self.error_counts.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn error_count(&self, key: &str) -> u64 {
        self.error_counts.get(key).map(|e| *e).unwrap_or(0)
    }

    pub fn last_update(&self, key: &str) -> Option<i64> {
        self.last_update.get(key).map(|e| *e)
    }

    /// Per-loop counters merged with the bus's own stats.
    pub fn stats(&self) -> PublisherStats {
        let loops = self
            .loops
            .lock()
            .iter()
            .map(|def| LoopSnapshot {
                name: def.name.clone(),
                published: def.stats.published.load(Ordering::Relaxed),
                errors: def.stats.errors.load(Ordering::Relaxed),
                last_run_ms: def.stats.last_run_ms.load(Ordering::Relaxed),
            })
            .collect();
        PublisherStats {
            publisher: self.name.clone(),
            loops,
            symbols: self.symbols.snapshot(),
            bus: self.bus.stats(),
        }
    }

    /// Escape hatch: publish a free-form payload through the shared bus with
    /// the same ordering and isolation rules as the loops.
    pub async fn publish_custom(
        &self,
        topic: &str,
        value: serde_json::Value,
    ) -> Result<Event, BusError> {
        self.bus.publish(topic, Payload::Custom { value }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[test]
    fn test_symbol_list_normalizes_and_dedupes() {
        let list = SymbolList::new(vec!["btc-usdt".to_string(), " BTC-USDT ".to_string()]);
        assert_eq!(list.snapshot(), vec!["BTC-USDT".to_string()]);

        assert!(list.add("eth-usdt"));
        assert!(!list.add("ETH-USDT"));
        assert!(list.remove("Eth-Usdt"));
        assert!(!list.remove("ETH-USDT"));
        assert!(!list.add(""));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_symbol_snapshot_is_isolated() {
        let list = SymbolList::new(vec!["BTC-USDT".to_string()]);
        let snapshot = list.snapshot();
        list.add("ETH-USDT");
        assert_eq!(snapshot, vec!["BTC-USDT".to_string()]);
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn test_loop_repeats_and_counts_published() {
        init_tracing();
        let bus = EventBus::new();
        let harness = PublisherHarness::new("test", bus.clone());

        let runs = Arc::new(AtomicU64::new(0));
        let loop_runs = runs.clone();
        harness.add_loop(LoopDef::new("tick", Duration::from_millis(10), move || {
            let runs = loop_runs.clone();
            async move {
                runs.fetch_add(1, Ordering::Relaxed);
                Ok(2)
            }
        }));

        harness.start();
        assert!(harness.is_running());
        let probe = runs.clone();
        wait_until(move || probe.load(Ordering::Relaxed) >= 3).await;
        harness.stop(Duration::from_secs(1)).await;
        assert!(!harness.is_running());

        let stats = harness.stats();
        assert_eq!(stats.loops.len(), 1);
        assert!(stats.loops[0].published >= 6);
        assert_eq!(stats.loops[0].errors, 0);
        assert!(stats.loops[0].last_run_ms > 0);
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_long_interval() {
        let bus = EventBus::new();
        let harness = PublisherHarness::new("test", bus.clone());

        let runs = Arc::new(AtomicU64::new(0));
        let loop_runs = runs.clone();
        harness.add_loop(LoopDef::new("slow", Duration::from_secs(60), move || {
            let runs = loop_runs.clone();
            async move {
                runs.fetch_add(1, Ordering::Relaxed);
                Ok(0)
            }
        }));

        harness.start();
        let probe = runs.clone();
        wait_until(move || probe.load(Ordering::Relaxed) >= 1).await;

        // The loop is now inside its 60s wait; stop must not sit it out
        let before = tokio::time::Instant::now();
        harness.stop(Duration::from_secs(2)).await;
        assert!(before.elapsed() < Duration::from_secs(2));
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failing_iteration_does_not_kill_loop() {
        init_tracing();
        let bus = EventBus::new();
        let harness = PublisherHarness::new("test", bus.clone());

        let runs = Arc::new(AtomicU64::new(0));
        let loop_runs = runs.clone();
        harness.add_loop(LoopDef::new("flaky", Duration::from_millis(5), move || {
            let runs = loop_runs.clone();
            async move {
                let run = runs.fetch_add(1, Ordering::Relaxed);
                match run {
                    0 => anyhow::bail!("transient failure"),
                    1 => panic!("hard failure"),
                    _ => Ok(1),
                }
            }
        }));

        harness.start();
        let probe = runs.clone();
        wait_until(move || probe.load(Ordering::Relaxed) >= 4).await;
        harness.stop(Duration::from_secs(1)).await;

        let stats = harness.stats();
        assert_eq!(stats.loops[0].errors, 2);
        assert!(stats.loops[0].published >= 1);
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_disabled_loop_is_not_spawned() {
        let bus = EventBus::new();
        let harness = PublisherHarness::new("test", bus.clone());

        let runs = Arc::new(AtomicU64::new(0));
        let loop_runs = runs.clone();
        harness.add_loop(
            LoopDef::new("off", Duration::from_millis(5), move || {
                let runs = loop_runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::Relaxed);
                    Ok(0)
                }
            })
            .disabled(),
        );

        harness.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.stop(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::Relaxed), 0);
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stats_merge_bus_counters() {
        let bus = EventBus::new();
        let harness = PublisherHarness::new("test", bus.clone());

        let loop_bus = bus.clone();
        harness.add_loop(LoopDef::new("pub", Duration::from_millis(10), move || {
            let bus = loop_bus.clone();
            async move {
                bus.publish_sync(
                    "market.price.BTC-USDT",
                    Payload::Price {
                        symbol: "BTC-USDT".to_string(),
                        price: 1.0,
                        timestamp_ms: 0,
                    },
                )?;
                Ok(1)
            }
        }));

        harness.start();
        let probe = bus.clone();
        wait_until(move || probe.stats().published >= 2).await;
        harness.stop(Duration::from_secs(1)).await;

        let stats = harness.stats();
        assert!(stats.bus.published >= 2);
        assert!(stats.loops[0].published >= 2);
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_publish_custom_flows_through_bus() {
        let bus = EventBus::new();
        let harness = PublisherHarness::new("test", bus.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe("factor.momentum.*", move |ev: &Event| {
            sink.lock().push(ev.clone());
            Ok(())
        })
        .unwrap();

        harness
            .publish_custom("factor.momentum.BTC-USDT", serde_json::json!({"value": 0.7}))
            .await
            .unwrap();

        let probe = seen.clone();
        wait_until(move || probe.lock().len() == 1).await;
        assert_eq!(seen.lock()[0].topic, "factor.momentum.BTC-USDT");
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_error_bookkeeping_per_key() {
        let bus = EventBus::new();
        let harness = PublisherHarness::new("test", bus.clone());

        harness.mark_error("price.BTC-USDT");
        harness.mark_error("price.BTC-USDT");
        harness.mark_update("price.ETH-USDT");

        assert_eq!(harness.error_count("price.BTC-USDT"), 2);
        assert_eq!(harness.error_count("price.ETH-USDT"), 0);
        assert!(harness.last_update("price.ETH-USDT").is_some());
        assert!(harness.last_update("price.BTC-USDT").is_none());
        bus.shutdown(Duration::from_secs(1)).await;
    }
}
