//! polysight - microstructure detection engine for prediction markets.
//!
//! Ingests a live stream of quotes and trades, maintains bounded per-market
//! ring-buffer state, and emits typed early signals for orderbook and flow
//! anomalies. Notification, persistence and the market catalog are external
//! collaborators behind the traits in [`sink`].

pub mod analyzers;
pub mod breaker;
pub mod buffers;
pub mod config;
pub mod engine;
pub mod models;
pub mod signals;
pub mod sink;
pub mod spread;
pub mod stats;
pub mod stream;

pub use config::{EngineConfig, SharedConfig};
pub use engine::{HealthReport, MicrostructureDetector};
pub use models::{
    BookLevel, CatalogMarket, EarlySignal, MarketEvent, OrderbookSnapshot, PricePoint, Severity,
    Side, SignalKind, Tick, TimeHorizon,
};
pub use sink::{LogSink, MarketCatalog, NoopWriter, SignalSink, SignalWriter};
