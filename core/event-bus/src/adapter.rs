//! Data-source adapter contract
//!
//! The bus never talks to an exchange directly. Publishers consume a
//! [`DataSource`] — the narrow seam behind which any exchange driver lives.
//! Every call may fail; publishers treat a failure as transient, log it and
//! continue with the next symbol or the next iteration.

use crate::error::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One OHLCV row. `get_klines` returns rows ordered oldest first, newest last.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Orderbook snapshot. Levels are `(price, size)`, bids best-first
/// descending, asks best-first ascending.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Orderbook {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Balance for one currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub balance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

/// Open position for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// One open order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub status: OrderStatus,
}

/// Exchange driver surface consumed by the concrete publishers.
///
/// Implementations wrap a venue's REST/WS client; the crate ships
/// [`SimulatedDataSource`](crate::sim::SimulatedDataSource) for tests and
/// demos.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Latest traded price for `symbol`.
    async fn get_price_now(&self, symbol: &str) -> Result<f64, AdapterError>;

    /// Orderbook snapshot with up to `depth` levels per side.
    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<Orderbook, AdapterError>;

    /// Up to `limit` OHLCV rows for `symbol`/`timeframe`, newest last.
    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, AdapterError>;

    /// Balance for one currency.
    async fn get_balance(&self, currency: &str) -> Result<Balance, AdapterError>;

    /// All open positions.
    async fn get_positions(&self) -> Result<Vec<Position>, AdapterError>;

    /// Open orders for one symbol.
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, AdapterError>;
}
