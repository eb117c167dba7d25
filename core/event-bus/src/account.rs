//! Account-data publisher
//!
//! Three loops over one [`DataSource`]: balances, positions and open orders.
//! The position loop retains its latest snapshot; when no explicit symbol
//! list is configured, the order loop derives its symbol set from that
//! snapshot at the start of every iteration, so closed positions stop being
//! monitored on the next pass.
//!
//! Topics: `account.balance.{currency}`, `account.position.{symbol}`,
//! `account.position.all`, `account.order.{symbol}`,
//! `account.order.{symbol}.list`.

use crate::adapter::{DataSource, Position};
use crate::bus::EventBus;
use crate::config::AccountConfig;
use crate::error::BusError;
use crate::events::{Event, Payload};
use crate::harness::{LoopDef, PublisherHarness, PublisherStats, SymbolList};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

async fn publish_balances(
    harness: &PublisherHarness,
    source: &dyn DataSource,
    account_id: u64,
    currencies: &[String],
) -> anyhow::Result<u64> {
    let mut published = 0;
    for currency in currencies {
        match source.get_balance(currency).await {
            Ok(balance) => {
                harness
                    .bus()
                    .publish(
                        &format!("account.balance.{currency}"),
                        Payload::Balance {
                            account_id,
                            currency: balance.currency,
                            balance: balance.balance,
                            timestamp_ms: Utc::now().timestamp_millis(),
                        },
                    )
                    .await?;
                harness.mark_update(&format!("balance.{currency}"));
                published += 1;
            }
            Err(e) => {
                harness.mark_error(&format!("balance.{currency}"));
                warn!(currency = %currency, "balance fetch failed: {e}");
            }
        }
    }
    Ok(published)
}

/// One position pass: per-symbol events, the `account.position.all`
/// aggregate, and the retained snapshot the order loop reads. The aggregate
/// goes out even when no position is open, so subscribers observe closures.
async fn publish_positions(
    harness: &PublisherHarness,
    source: &dyn DataSource,
    account_id: u64,
    last_positions: &RwLock<Vec<Position>>,
) -> anyhow::Result<u64> {
    let positions = match source.get_positions().await {
        Ok(positions) => positions,
        Err(e) => {
            harness.mark_error("position.all");
            warn!("position fetch failed: {e}");
            return Ok(0);
        }
    };

    let mut published = 0;
    for position in &positions {
        harness
            .bus()
            .publish(
                &format!("account.position.{}", position.symbol),
                Payload::Position {
                    account_id,
                    position: position.clone(),
                    timestamp_ms: Utc::now().timestamp_millis(),
                },
            )
            .await?;
        published += 1;
    }
    harness
        .bus()
        .publish(
            "account.position.all",
            Payload::PositionList {
                account_id,
                positions: positions.clone(),
                timestamp_ms: Utc::now().timestamp_millis(),
            },
        )
        .await?;
    published += 1;
    harness.mark_update("position.all");

    *last_positions.write() = positions;
    Ok(published)
}

/// One order pass. Symbols come from the explicit list when one is
/// configured, otherwise from the latest position snapshot. Symbols with no
/// open orders publish nothing.
async fn publish_orders(
    harness: &PublisherHarness,
    source: &dyn DataSource,
    account_id: u64,
    last_positions: &RwLock<Vec<Position>>,
) -> anyhow::Result<u64> {
    let symbols = if harness.symbols().is_empty() {
        // Hedge-mode accounts can hold two positions per symbol
        let mut derived: Vec<String> = Vec::new();
        for p in last_positions.read().iter() {
            if !derived.contains(&p.symbol) {
                derived.push(p.symbol.clone());
            }
        }
        derived
    } else {
        harness.symbols().snapshot()
    };

    let mut published = 0;
    for symbol in symbols {
        let orders = match source.get_open_orders(&symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                harness.mark_error(&format!("order.{symbol}"));
                warn!(symbol = %symbol, "order fetch failed: {e}");
                continue;
            }
        };
        if orders.is_empty() {
            continue;
        }

        for order in &orders {
            harness
                .bus()
                .publish(
                    &format!("account.order.{symbol}"),
                    Payload::Order {
                        account_id,
                        order: order.clone(),
                        timestamp_ms: Utc::now().timestamp_millis(),
                    },
                )
                .await?;
            published += 1;
        }
        harness
            .bus()
            .publish(
                &format!("account.order.{symbol}.list"),
                Payload::OrderList {
                    account_id,
                    symbol: symbol.clone(),
                    orders,
                    timestamp_ms: Utc::now().timestamp_millis(),
                },
            )
            .await?;
        published += 1;
        harness.mark_update(&format!("order.{symbol}"));
    }
    Ok(published)
}

/// Scheduled account-data distribution for one account.
pub struct AccountDataPublisher {
    harness: Arc<PublisherHarness>,
    config: AccountConfig,
    last_positions: Arc<RwLock<Vec<Position>>>,
}

impl AccountDataPublisher {
    pub fn new(source: Arc<dyn DataSource>, bus: EventBus, config: AccountConfig) -> Self {
        let harness = Arc::new(PublisherHarness::with_symbols(
            "account-data",
            bus,
            config.symbols.clone().unwrap_or_default(),
        ));
        let last_positions = Arc::new(RwLock::new(Vec::new()));
        register_loops(&harness, source, &config, &last_positions);
        Self {
            harness,
            config,
            last_positions,
        }
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    /// Positions seen by the most recent position pass.
    pub fn last_positions(&self) -> Vec<Position> {
        self.last_positions.read().clone()
    }

    pub fn symbols(&self) -> Arc<SymbolList> {
        self.harness.symbols()
    }

    pub fn is_running(&self) -> bool {
        self.harness.is_running()
    }

    pub fn start(&self) {
        self.harness.start();
    }

    pub async fn stop(&self, timeout: Duration) {
        self.harness.stop(timeout).await;
    }

    /// Pins the order loop to an explicit symbol; disables derivation from
    /// positions while the list is non-empty.
    pub fn add_symbol(&self, symbol: &str) -> bool {
        self.harness.add_symbol(symbol)
    }

    pub fn remove_symbol(&self, symbol: &str) -> bool {
        self.harness.remove_symbol(symbol)
    }

    pub fn error_count(&self, key: &str) -> u64 {
        self.harness.error_count(key)
    }

    pub fn last_update(&self, key: &str) -> Option<i64> {
        self.harness.last_update(key)
    }

    pub fn stats(&self) -> PublisherStats {
        self.harness.stats()
    }

    pub async fn publish_custom(
        &self,
        topic: &str,
        value: serde_json::Value,
    ) -> Result<Event, BusError> {
        self.harness.publish_custom(topic, value).await
    }
}

fn register_loops(
    harness: &Arc<PublisherHarness>,
    source: Arc<dyn DataSource>,
    cfg: &AccountConfig,
    last_positions: &Arc<RwLock<Vec<Position>>>,
) {
    let weak: Weak<PublisherHarness> = Arc::downgrade(harness);
    let account_id = cfg.account_id;

    let (h, s, currencies) = (weak.clone(), source.clone(), cfg.currencies.clone());
    harness.add_loop(LoopDef::new(
        "balance",
        Duration::from_millis(cfg.balance_interval_ms),
        move || {
            let (h, s, currencies) = (h.clone(), s.clone(), currencies.clone());
            async move {
                let Some(harness) = h.upgrade() else { return Ok(0) };
                publish_balances(&harness, &*s, account_id, &currencies).await
            }
        },
    ));

    let (h, s, positions) = (weak.clone(), source.clone(), last_positions.clone());
    harness.add_loop(LoopDef::new(
        "position",
        Duration::from_millis(cfg.position_interval_ms),
        move || {
            let (h, s, positions) = (h.clone(), s.clone(), positions.clone());
            async move {
                let Some(harness) = h.upgrade() else { return Ok(0) };
                publish_positions(&harness, &*s, account_id, &positions).await
            }
        },
    ));

    let (h, s, positions) = (weak, source, last_positions.clone());
    harness.add_loop(LoopDef::new(
        "order",
        Duration::from_millis(cfg.order_interval_ms),
        move || {
            let (h, s, positions) = (h.clone(), s.clone(), positions.clone());
            async move {
                let Some(harness) = h.upgrade() else { return Ok(0) };
                publish_orders(&harness, &*s, account_id, &positions).await
            }
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{OpenOrder, OrderSide, OrderStatus, PositionSide};
    use crate::sim::SimulatedDataSource;
    use parking_lot::Mutex;

    fn position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: 1.0,
            entry_price: 100.0,
            unrealized_pnl: 0.0,
        }
    }

    fn order(id: &str, symbol: &str) -> OpenOrder {
        OpenOrder {
            order_id: id.to_string(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            price: 95.0,
            quantity: 1.0,
            status: OrderStatus::Open,
        }
    }

    fn collect(bus: &EventBus, pattern: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(pattern, move |ev: &Event| {
            sink.lock().push(ev.clone());
            Ok(())
        })
        .unwrap();
        seen
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

    #[tokio::test]
    async fn test_balance_pass_publishes_per_currency() {
        let bus = EventBus::new();
        let seen = collect(&bus, "account.balance.*");
        let harness = PublisherHarness::new("account-data", bus.clone());
        let sim = SimulatedDataSource::with_seed(42);
        sim.set_balance("USDT", 5_000.0);
        sim.set_balance("BTC", 0.25);

        let currencies = vec!["USDT".to_string(), "BTC".to_string()];
        let published = publish_balances(&harness, &sim, 7, &currencies).await.unwrap();
        assert_eq!(published, 2);

        let probe = seen.clone();
        wait_until(move || probe.lock().len() == 2).await;
        let events = seen.lock();
        assert!(events.iter().any(|e| e.topic == "account.balance.USDT"));
        match &events[0].payload {
            Payload::Balance { account_id, .. } => assert_eq!(*account_id, 7),
            other => panic!("unexpected payload: {other:?}"),
        }
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_balance_fetch_error_is_counted_not_fatal() {
        let bus = EventBus::new();
        let harness = PublisherHarness::new("account-data", bus.clone());
        let sim = SimulatedDataSource::with_seed(42).fail_every(1);

        let currencies = vec!["USDT".to_string()];
        let published = publish_balances(&harness, &sim, 7, &currencies).await.unwrap();
        assert_eq!(published, 0);
        assert_eq!(harness.error_count("balance.USDT"), 1);
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_position_pass_publishes_per_symbol_and_aggregate() {
        let bus = EventBus::new();
        let seen = collect(&bus, "account.position.*");
        let harness = PublisherHarness::new("account-data", bus.clone());
        let sim = SimulatedDataSource::with_seed(42);
        sim.set_positions(vec![position("BTC-USDT"), position("ETH-USDT")]);
        let snapshot = RwLock::new(Vec::new());

        let published = publish_positions(&harness, &sim, 7, &snapshot).await.unwrap();
        assert_eq!(published, 3);

        let probe = seen.clone();
        wait_until(move || probe.lock().len() == 3).await;
        let events = seen.lock();
        assert!(events.iter().any(|e| e.topic == "account.position.BTC-USDT"));
        assert!(events.iter().any(|e| e.topic == "account.position.ETH-USDT"));
        let aggregate = events
            .iter()
            .find(|e| e.topic == "account.position.all")
            .unwrap();
        match &aggregate.payload {
            Payload::PositionList { positions, .. } => assert_eq!(positions.len(), 2),
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(snapshot.read().len(), 2);
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_empty_position_pass_still_publishes_aggregate() {
        let bus = EventBus::new();
        let seen = collect(&bus, "account.position.all");
        let harness = PublisherHarness::new("account-data", bus.clone());
        let sim = SimulatedDataSource::with_seed(42);
        let snapshot = RwLock::new(vec![position("BTC-USDT")]);

        let published = publish_positions(&harness, &sim, 7, &snapshot).await.unwrap();
        assert_eq!(published, 1);
        assert!(snapshot.read().is_empty());

        let probe = seen.clone();
        wait_until(move || probe.lock().len() == 1).await;
        match &seen.lock()[0].payload {
            Payload::PositionList { positions, .. } => assert!(positions.is_empty()),
            other => panic!("unexpected payload: {other:?}"),
        }
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_order_pass_publishes_per_order_and_list() {
        let bus = EventBus::new();
        let orders = collect(&bus, "account.order.*");
        let lists = collect(&bus, "account.order.*.list");
        let harness = PublisherHarness::with_symbols(
            "account-data",
            bus.clone(),
            vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
        );
        let sim = SimulatedDataSource::with_seed(42);
        sim.set_open_orders(
            "BTC-USDT",
            vec![order("1", "BTC-USDT"), order("2", "BTC-USDT")],
        );
        let snapshot = RwLock::new(Vec::new());

        // ETH-USDT has no open orders: nothing published for it, no list.
        let published = publish_orders(&harness, &sim, 7, &snapshot).await.unwrap();
        assert_eq!(published, 3);

        let probe = lists.clone();
        wait_until(move || probe.lock().len() == 1).await;
        assert_eq!(orders.lock().len(), 2);
        assert!(orders
            .lock()
            .iter()
            .all(|e| e.topic == "account.order.BTC-USDT"));
        match &lists.lock()[0].payload {
            Payload::OrderList { symbol, orders, .. } => {
                assert_eq!(symbol, "BTC-USDT");
                assert_eq!(orders.len(), 2);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(harness.last_update("order.ETH-USDT").is_none());
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_order_symbols_follow_position_snapshot() {
        let bus = EventBus::new();
        let lists = collect(&bus, "account.order.*.list");
        let harness = PublisherHarness::new("account-data", bus.clone());
        let sim = SimulatedDataSource::with_seed(42);
        sim.set_open_orders("ETH-USDT", vec![order("1", "ETH-USDT")]);
        let snapshot = RwLock::new(Vec::new());

        // No explicit symbols and no snapshot yet: nothing to monitor.
        assert_eq!(publish_orders(&harness, &sim, 7, &snapshot).await.unwrap(), 0);

        sim.set_positions(vec![position("ETH-USDT")]);
        publish_positions(&harness, &sim, 7, &snapshot).await.unwrap();
        assert_eq!(publish_orders(&harness, &sim, 7, &snapshot).await.unwrap(), 2);

        // Position closed: the next order pass stops monitoring the symbol.
        sim.set_positions(Vec::new());
        publish_positions(&harness, &sim, 7, &snapshot).await.unwrap();
        assert_eq!(publish_orders(&harness, &sim, 7, &snapshot).await.unwrap(), 0);

        let probe = lists.clone();
        wait_until(move || probe.lock().len() == 1).await;
        assert_eq!(lists.lock()[0].topic, "account.order.ETH-USDT.list");
        bus.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_publisher_runs_all_loops() {
        let bus = EventBus::new();
        let balances = collect(&bus, "account.balance.*");
        let aggregates = collect(&bus, "account.position.all");
        let lists = collect(&bus, "account.order.*.list");

        let sim = Arc::new(SimulatedDataSource::with_seed(42));
        sim.set_positions(vec![position("BTC-USDT")]);
        sim.set_open_orders("BTC-USDT", vec![order("1", "BTC-USDT")]);

        let cfg = AccountConfig {
            account_id: 7,
            symbols: None,
            currencies: vec!["USDT".to_string()],
            balance_interval_ms: 10,
            position_interval_ms: 10,
            order_interval_ms: 10,
        };
        let publisher = AccountDataPublisher::new(sim, bus.clone(), cfg);

        publisher.start();
        let (b, a, l) = (balances.clone(), aggregates.clone(), lists.clone());
        wait_until(move || {
            !b.lock().is_empty() && !a.lock().is_empty() && !l.lock().is_empty()
        })
        .await;
        publisher.stop(Duration::from_secs(1)).await;

        assert_eq!(publisher.last_positions().len(), 1);
        let stats = publisher.stats();
        assert_eq!(stats.loops.len(), 3);
        assert!(stats.loops.iter().all(|l| l.published >= 1));
        bus.shutdown(Duration::from_secs(1)).await;
    }
}
