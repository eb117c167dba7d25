//! Simulated data source for tests and demos
//!
//! Seeded random-walk prices with static, mutable account state. Failure
//! injection (`fail_every`) exercises the publishers' partial-failure paths
//! without a live venue.

use crate::adapter::{Balance, DataSource, Kline, OpenOrder, Orderbook, Position};
use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Milliseconds covered by one kline of the given timeframe.
fn timeframe_ms(timeframe: &str) -> i64 {
    match timeframe {
        "1m" => 60_000,
        "5m" => 300_000,
        "15m" => 900_000,
        "30m" => 1_800_000,
        "1h" => 3_600_000,
        "4h" => 14_400_000,
        "1d" => 86_400_000,
        _ => 60_000,
    }
}

struct SimState {
    rng: StdRng,
    prices: HashMap<String, f64>,
    balances: HashMap<String, f64>,
    positions: Vec<Position>,
    orders: HashMap<String, Vec<OpenOrder>>,
    calls: u64,
    fail_every: Option<u64>,
}

/// Deterministic in-memory [`DataSource`].
pub struct SimulatedDataSource {
    volatility: f64,
    state: Mutex<SimState>,
}

impl SimulatedDataSource {
    /// Simulator seeded from entropy with the default instruments.
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen())
    }

    /// Reproducible simulator for tests.
    pub fn with_seed(seed: u64) -> Self {
        let mut prices = HashMap::new();
        prices.insert("BTC-USDT".to_string(), 50_000.0);
        prices.insert("ETH-USDT".to_string(), 3_000.0);

        Self {
            volatility: 0.0005,
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                prices,
                balances: HashMap::new(),
                positions: Vec::new(),
                orders: HashMap::new(),
                calls: 0,
                fail_every: None,
            }),
        }
    }

    /// Makes every `n`-th adapter call fail with a transport error.
    pub fn fail_every(self, n: u64) -> Self {
        self.state.lock().fail_every = Some(n.max(1));
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, currency: &str, balance: f64) {
        self.state.lock().balances.insert(currency.to_string(), balance);
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        self.state.lock().positions = positions;
    }

    pub fn set_open_orders(&self, symbol: &str, orders: Vec<OpenOrder>) {
        self.state.lock().orders.insert(symbol.to_string(), orders);
    }

    fn tick(&self, state: &mut SimState) -> Result<(), AdapterError> {
        state.calls += 1;
        if let Some(n) = state.fail_every {
            if state.calls % n == 0 {
                return Err(AdapterError::transport("injected failure"));
            }
        }
        Ok(())
    }

    fn walk_price(&self, state: &mut SimState, symbol: &str) -> f64 {
        let step: f64 = state.rng.gen_range(-1.0..1.0) * self.volatility;
        let price = state.prices.entry(symbol.to_string()).or_insert(1_000.0);
        *price *= 1.0 + step;
        *price
    }
}

impl Default for SimulatedDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for SimulatedDataSource {
    async fn get_price_now(&self, symbol: &str) -> Result<f64, AdapterError> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        Ok(self.walk_price(&mut state, symbol))
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<Orderbook, AdapterError> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        let mid = self.walk_price(&mut state, symbol);
        let spread = mid * 0.0001;

        let mut book = Orderbook::default();
        for level in 0..depth {
            let offset = spread * (level + 1) as f64;
            let size = state.rng.gen_range(0.1..5.0);
            book.bids.push((mid - offset, size));
            let size = state.rng.gen_range(0.1..5.0);
            book.asks.push((mid + offset, size));
        }
        Ok(book)
    }

    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, AdapterError> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;

        let step_ms = timeframe_ms(timeframe);
        let now_ms = Utc::now().timestamp_millis();
        let mut rows = Vec::with_capacity(limit);
        for i in (0..limit).rev() {
            let open = self.walk_price(&mut state, symbol);
            let close = self.walk_price(&mut state, symbol);
            let high = open.max(close) * 1.0005;
            let low = open.min(close) * 0.9995;
            let volume = state.rng.gen_range(1.0..100.0);
            rows.push(Kline {
                timestamp_ms: now_ms - step_ms * i as i64,
                open,
                high,
                low,
                close,
                volume,
            });
        }
        Ok(rows)
    }

    async fn get_balance(&self, currency: &str) -> Result<Balance, AdapterError> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        let balance = state.balances.get(currency).copied().unwrap_or(10_000.0);
        Ok(Balance { currency: currency.to_string(), balance })
    }

    async fn get_positions(&self) -> Result<Vec<Position>, AdapterError> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        Ok(state.positions.clone())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, AdapterError> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        Ok(state.orders.get(symbol).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{OrderSide, OrderStatus, PositionSide};

    #[tokio::test]
    async fn test_prices_walk_deterministically() {
        let a = SimulatedDataSource::with_seed(7);
        let b = SimulatedDataSource::with_seed(7);

        let pa = a.get_price_now("BTC-USDT").await.unwrap();
        let pb = b.get_price_now("BTC-USDT").await.unwrap();
        assert_eq!(pa, pb);
        assert!((pa - 50_000.0).abs() < 50_000.0 * 0.01);
    }

    #[tokio::test]
    async fn test_orderbook_shape() {
        let sim = SimulatedDataSource::with_seed(7);
        let book = sim.get_orderbook("ETH-USDT", 5).await.unwrap();
        assert_eq!(book.bids.len(), 5);
        assert_eq!(book.asks.len(), 5);
        // Bids below asks
        assert!(book.bids[0].0 < book.asks[0].0);
    }

    #[tokio::test]
    async fn test_klines_ordered_newest_last() {
        let sim = SimulatedDataSource::with_seed(7);
        let rows = sim.get_klines("BTC-USDT", "1m", 5).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
    }

    #[tokio::test]
    async fn test_fail_every_injects_failures() {
        let sim = SimulatedDataSource::with_seed(7).fail_every(2);
        assert!(sim.get_price_now("BTC-USDT").await.is_ok());
        assert!(sim.get_price_now("BTC-USDT").await.is_err());
        assert!(sim.get_price_now("BTC-USDT").await.is_ok());
        assert!(sim.get_price_now("BTC-USDT").await.is_err());
    }

    #[tokio::test]
    async fn test_account_state_mutators() {
        let sim = SimulatedDataSource::with_seed(7);
        sim.set_balance("USDT", 123.0);
        sim.set_positions(vec![Position {
            symbol: "ETH-USDT".to_string(),
            side: PositionSide::Long,
            quantity: 2.0,
            entry_price: 3_000.0,
            unrealized_pnl: 10.0,
        }]);
        sim.set_open_orders(
            "ETH-USDT",
            vec![OpenOrder {
                order_id: "1".to_string(),
                symbol: "ETH-USDT".to_string(),
                side: OrderSide::Buy,
                price: 2_900.0,
                quantity: 1.0,
                status: OrderStatus::Open,
            }],
        );

        assert_eq!(sim.get_balance("USDT").await.unwrap().balance, 123.0);
        assert_eq!(sim.get_positions().await.unwrap().len(), 1);
        assert_eq!(sim.get_open_orders("ETH-USDT").await.unwrap().len(), 1);
        assert!(sim.get_open_orders("BTC-USDT").await.unwrap().is_empty());
    }
}
