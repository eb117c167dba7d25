//! # Trading Event Bus
//!
//! Topic-based pub/sub bus plus scheduled publishers for market and account
//! data distribution.
//!
//! ## Features
//!
//! - **Topic Matching**: Dot-separated topics with `*` single-segment wildcards
//! - **Dispatch Modes**: Inline sync dispatch or a bounded FIFO queue with workers
//! - **Overflow Policies**: Block with a timeout, or drop the oldest event
//! - **Isolation**: A failing or panicking subscriber never stops delivery
//! - **Publisher Harness**: Independently timed loops with interruptible waits
//! - **Adapter Seam**: Publishers consume any [`DataSource`]; a simulator ships in-crate
//!
//! ## Example
//!
//! ```rust
//! use trading_event_bus::{Event, EventBus, Payload};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = EventBus::new();
//!
//!     // Subscribe to every price topic
//!     bus.subscribe("market.price.*", |event: &Event| {
//!         println!("{}: {:?}", event.topic, event.payload);
//!         Ok(())
//!     })?;
//!
//!     // Publish an event
//!     bus.publish(
//!         "market.price.BTC-USDT",
//!         Payload::Price {
//!             symbol: "BTC-USDT".to_string(),
//!             price: 50_000.0,
//!             timestamp_ms: 0,
//!         },
//!     )
//!     .await?;
//!
//!     // Drain the queue, then reject further publishes
//!     bus.shutdown(std::time::Duration::from_secs(1)).await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod harness;
pub mod topic;

// Scheduled publishers
pub mod account;
pub mod market;
pub mod sim;

// Re-exports
pub use adapter::{
    Balance, DataSource, Kline, OpenOrder, Orderbook, OrderSide, OrderStatus, Position,
    PositionSide,
};
pub use bus::{
    default_bus, init_default_bus, shutdown_default_bus, BusStats, EventBus, SubscriberFn,
    SubscriptionId,
};
pub use config::{AccountConfig, BusConfig, DispatchMode, MarketConfig, OverflowPolicy};
pub use error::{AdapterError, AdapterErrorKind, BusError};
pub use events::{Event, Payload};
pub use harness::{
    normalize_symbol, LoopDef, LoopSnapshot, PublisherHarness, PublisherStats, SymbolList, WorkFn,
};

pub use account::AccountDataPublisher;
pub use market::MarketDataPublisher;
pub use sim::SimulatedDataSource;
