//! Market-data publisher
//!
//! Three loops over one [`DataSource`]: prices, orderbook snapshots and the
//! newest kline per timeframe. Each loop walks the current symbol snapshot;
//! a failing symbol is logged and skipped, the rest of the pass continues.
//!
//! Topics: `market.price.{symbol}`, `market.orderbook.{symbol}`,
//! `market.kline.{symbol}.{timeframe}`.

use crate::adapter::DataSource;
use crate::bus::EventBus;
use crate::config::MarketConfig;
use crate::error::BusError;
use crate::events::{Event, Payload};
use crate::harness::{LoopDef, PublisherHarness, PublisherStats, SymbolList};
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

async fn publish_prices(
    harness: &PublisherHarness,
    source: &dyn DataSource,
) -> anyhow::Result<u64> {
    let mut published = 0;
    for symbol in harness.symbols().snapshot() {
        match source.get_price_now(&symbol).await {
            Ok(price) => {
                harness
                    .bus()
                    .publish(
                        &format!("market.price.{symbol}"),
                        Payload::Price {
                            symbol: symbol.clone(),
                            price,
                            timestamp_ms: Utc::now().timestamp_millis(),
                        },
                    )
                    .await?;
                harness.mark_update(&format!("price.{symbol}"));
                published += 1;
            }
            Err(e) => {
                harness.mark_error(&format!("price.{symbol}"));
                warn!(symbol = %symbol, "price fetch failed: {e}");
            }
        }
    }
    Ok(published)
}

async fn publish_orderbooks(
    harness: &PublisherHarness,
    source: &dyn DataSource,
    depth: usize,
) -> anyhow::Result<u64> {
    let mut published = 0;
    for symbol in harness.symbols().snapshot() {
        match source.get_orderbook(&symbol, depth).await {
            Ok(book) => {
                harness
                    .bus()
                    .publish(
                        &format!("market.orderbook.{symbol}"),
                        Payload::Orderbook {
                            symbol: symbol.clone(),
                            bids: book.bids,
                            asks: book.asks,
                            timestamp_ms: Utc::now().timestamp_millis(),
                        },
                    )
                    .await?;
                harness.mark_update(&format!("orderbook.{symbol}"));
                published += 1;
            }
            Err(e) => {
                harness.mark_error(&format!("orderbook.{symbol}"));
                warn!(symbol = %symbol, "orderbook fetch failed: {e}");
            }
        }
    }
    Ok(published)
}

async fn publish_klines(
    harness: &PublisherHarness,
    source: &dyn DataSource,
    timeframes: &[String],
    limit: usize,
) -> anyhow::Result<u64> {
    let mut published = 0;
    for symbol in harness.symbols().snapshot() {
        for timeframe in timeframes {
            match source.get_klines(&symbol, timeframe, limit).await {
                // Rows arrive newest last; only the freshest one goes out.
                Ok(rows) => {
                    let Some(row) = rows.last() else { continue };
                    harness
                        .bus()
                        .publish(
                            &format!("market.kline.{symbol}.{timeframe}"),
                            Payload::Kline {
                                symbol: symbol.clone(),
                                timeframe: timeframe.clone(),
                                open: row.open,
                                high: row.high,
                                low: row.low,
                                close: row.close,
                                volume: row.volume,
                                timestamp_ms: row.timestamp_ms,
                            },
                        )
                        .await?;
                    harness.mark_update(&format!("kline.{symbol}.{timeframe}"));
                    published += 1;
                }
                Err(e) => {
                    harness.mark_error(&format!("kline.{symbol}.{timeframe}"));
                    warn!(symbol = %symbol, timeframe = %timeframe, "kline fetch failed: {e}");
                }
            }
        }
    }
    Ok(published)
}

/// Scheduled market-data distribution for a set of symbols.
pub struct MarketDataPublisher {
    harness: Arc<PublisherHarness>,
    config: MarketConfig,
}

impl MarketDataPublisher {
    pub fn new(source: Arc<dyn DataSource>, bus: EventBus, config: MarketConfig) -> Self {
        let harness = Arc::new(PublisherHarness::with_symbols(
            "market-data",
            bus,
            config.symbols.clone(),
        ));
        register_loops(&harness, source, &config);
        Self { harness, config }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
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

fn register_loops(harness: &Arc<PublisherHarness>, source: Arc<dyn DataSource>, cfg: &MarketConfig) {
    // Loops hold a weak handle; a dropped publisher leaves them as no-ops
    // until stop joins them.
    let weak: Weak<PublisherHarness> = Arc::downgrade(harness);

    let (h, s) = (weak.clone(), source.clone());
    harness.add_loop(LoopDef::new(
        "price",
        Duration::from_millis(cfg.price_interval_ms),
        move || {
            let (h, s) = (h.clone(), s.clone());
            async move {
                let Some(harness) = h.upgrade() else { return Ok(0) };
                publish_prices(&harness, &*s).await
            }
        },
    ));

    let (h, s, depth) = (weak.clone(), source.clone(), cfg.orderbook_depth);
    harness.add_loop(LoopDef::new(
        "orderbook",
        Duration::from_millis(cfg.orderbook_interval_ms),
        move || {
            let (h, s) = (h.clone(), s.clone());
            async move {
                let Some(harness) = h.upgrade() else { return Ok(0) };
                publish_orderbooks(&harness, &*s, depth).await
            }
        },
    ));

    let timeframes = cfg.timeframes.clone();
    let limit = cfg.kline_limit;
    let (h, s) = (weak, source);
    harness.add_loop(LoopDef::new(
        "kline",
        Duration::from_millis(cfg.kline_interval_ms),
        move || {
            let (h, s, timeframes) = (h.clone(), s.clone(), timeframes.clone());
            async move {
                let Some(harness) = h.upgrade() else { return Ok(0) };
                publish_klines(&harness, &*s, &timeframes, limit).await
            }
        },
    ));
}
