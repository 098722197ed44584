//! Narrow interfaces to the external collaborators.
//!
//! The engine emits through these traits and knows nothing about webhook
//! formatting, rate limits, HTTP catalogs or database schemas. Defaults are
//! provided so the engine runs standalone: a tracing-backed sink and a
//! writer that drops everything.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::analyzers::frontrun::FrontRunAssessment;
use crate::analyzers::microstructure::MicroMetrics;
use crate::models::{CatalogMarket, EarlySignal, OrderbookSnapshot, Tick};

/// Downstream notification surface. Rate limiting and formatting live on the
/// other side of this trait.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn on_signal(&self, signal: &EarlySignal);

    /// Per-frame microstructure signals arrive on a separate hook so the
    /// sink can route them differently from catalog-scan signals.
    async fn on_microstructure_signal(&self, signal: &EarlySignal) {
        self.on_signal(signal).await;
    }
}

/// Market catalog collaborator, polled by the scan timer.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    async fn fetch_markets(&self) -> Result<Vec<CatalogMarket>>;
}

/// Append-only persistence collaborator. Schema is its problem, not ours.
#[async_trait]
pub trait SignalWriter: Send + Sync {
    async fn write_tick(&self, _tick: &Tick) -> Result<()> {
        Ok(())
    }
    async fn write_orderbook(&self, _snapshot: &OrderbookSnapshot) -> Result<()> {
        Ok(())
    }
    async fn write_signal(&self, _signal: &EarlySignal) -> Result<()> {
        Ok(())
    }
    async fn write_micro_metrics(&self, _market_id: &str, _metrics: &MicroMetrics) -> Result<()> {
        Ok(())
    }
    async fn write_front_running(&self, _assessment: &FrontRunAssessment) -> Result<()> {
        Ok(())
    }
}

/// Default sink: structured log lines, nothing else.
pub struct LogSink;

#[async_trait]
impl SignalSink for LogSink {
    async fn on_signal(&self, signal: &EarlySignal) {
        info!(
            market = %signal.market_id,
            kind = signal.kind.as_str(),
            severity = signal.severity.as_str(),
            confidence = format!("{:.2}", signal.confidence),
            "📣 {}",
            signal.description
        );
    }
}

/// Default writer: persistence disabled.
pub struct NoopWriter;

#[async_trait]
impl SignalWriter for NoopWriter {}
