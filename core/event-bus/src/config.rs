//! Configuration surface
//!
//! All structs deserialize from TOML with per-field defaults, so a config
//! file only needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How `publish` hands an event to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Dispatch runs on the caller's thread before `publish` returns.
    Sync,
    /// Event is appended to the bounded queue; dispatch workers deliver FIFO.
    Queued,
}

/// What happens when the queued-mode buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Publisher waits for space up to `block_timeout_ms`, then fails.
    Block,
    /// Oldest queued event is discarded and counted; the new event enters.
    DropOldest,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Default dispatch mode for `publish`.
    pub mode: DispatchMode,
    /// Queued-mode buffer capacity.
    pub queue_capacity: usize,
    /// Overflow policy for a full buffer.
    pub overflow: OverflowPolicy,
    /// Dispatch worker count. With the default single worker every
    /// subscriber sees the events it matches in publish order; more workers
    /// relax that ordering.
    pub workers: usize,
    /// Block-policy wait bound in milliseconds.
    pub block_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Queued,
            queue_capacity: 1000,
            overflow: OverflowPolicy::DropOldest,
            workers: 1,
            block_timeout_ms: 500,
        }
    }
}

impl BusConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

fn default_timeframes() -> Vec<String> {
    ["1m", "5m", "15m", "1h"].iter().map(|s| s.to_string()).collect()
}

fn default_currencies() -> Vec<String> {
    vec!["USDT".to_string()]
}

/// Market-data publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Symbols to monitor.
    pub symbols: Vec<String>,
    pub price_interval_ms: u64,
    pub orderbook_interval_ms: u64,
    pub kline_interval_ms: u64,
    /// Timeframes fetched by the kline loop.
    pub timeframes: Vec<String>,
    /// Orderbook depth requested per side.
    pub orderbook_depth: usize,
    /// Rows requested per kline fetch; only the newest row is published.
    pub kline_limit: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            price_interval_ms: 1000,
            orderbook_interval_ms: 2000,
            kline_interval_ms: 60_000,
            timeframes: default_timeframes(),
            orderbook_depth: 20,
            kline_limit: 1,
        }
    }
}

impl MarketConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Account-data publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub account_id: u64,
    /// Symbols monitored by the order loop. When `None`, the order loop
    /// derives its set from the latest position snapshot each iteration.
    pub symbols: Option<Vec<String>>,
    /// Currencies published by the balance loop.
    pub currencies: Vec<String>,
    pub balance_interval_ms: u64,
    pub position_interval_ms: u64,
    pub order_interval_ms: u64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account_id: 0,
            symbols: None,
            currencies: default_currencies(),
            balance_interval_ms: 5000,
            position_interval_ms: 5000,
            order_interval_ms: 3000,
        }
    }
}

impl AccountConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
