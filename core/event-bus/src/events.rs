//! Event and payload definitions
//!
//! Payloads are tagged per topic family instead of loose field maps, so a
//! schema mismatch is a compile error rather than a runtime surprise.
//! `Payload::Custom` stays available as the escape hatch for collaborators
//! (factor calculators, trade-response emitters) publishing through
//! `publish_custom`.

use crate::adapter::{OpenOrder, Position};
use serde::{Deserialize, Serialize};

/// Typed payload, one variant per topic family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Payload {
    /// `market.price.{symbol}`
    Price {
        symbol: String,
        price: f64,
        timestamp_ms: i64,
    },

    /// `market.orderbook.{symbol}`
    Orderbook {
        symbol: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
        timestamp_ms: i64,
    },

    /// `market.kline.{symbol}.{timeframe}`
    Kline {
        symbol: String,
        timeframe: String,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        timestamp_ms: i64,
    },

    /// `account.balance.{currency}`
    Balance {
        account_id: u64,
        currency: String,
        balance: f64,
        timestamp_ms: i64,
    },

    /// `account.position.{symbol}`
    Position {
        account_id: u64,
        position: Position,
        timestamp_ms: i64,
    },

    /// `account.position.all` aggregate
    PositionList {
        account_id: u64,
        positions: Vec<Position>,
        timestamp_ms: i64,
    },

    /// `account.order.{symbol}`
    Order {
        account_id: u64,
        order: OpenOrder,
        timestamp_ms: i64,
    },

    /// `account.order.{symbol}.list`
    OrderList {
        account_id: u64,
        symbol: String,
        orders: Vec<OpenOrder>,
        timestamp_ms: i64,
    },

    /// Free-form payload for any other topic family.
    Custom { value: serde_json::Value },
}

impl Payload {
    /// Short family tag, used in logs.
    pub fn family(&self) -> &'static str {
        match self {
            Self::Price { .. } => "price",
            Self::Orderbook { .. } => "orderbook",
            Self::Kline { .. } => "kline",
            Self::Balance { .. } => "balance",
            Self::Position { .. } => "position",
            Self::PositionList { .. } => "position_list",
            Self::Order { .. } => "order",
            Self::OrderList { .. } => "order_list",
            Self::Custom { .. } => "custom",
        }
    }
}

/// A published event. Immutable once published.
///
/// `sequence` is assigned at publish time under the bus's single ordering
/// lock: strictly increasing per bus instance, never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Payload,
    pub sequence: u64,
    pub timestamp_ms: i64,
}
