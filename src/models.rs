//! Core market data types shared across the engine.
//!
//! Prices in prediction markets are probabilities in (0, 1]. Every metric
//! downstream must stay price-level-independent, so the types here carry
//! absolute spreads and probability-point changes, never relative percents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// A single trade. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp_ms: i64,
    pub market_id: String,
    /// Probability in (0, 1].
    pub price: f64,
    /// Trade size in shares. Always > 0.
    pub size: f64,
    /// Notional volume (price * size).
    pub volume: f64,
    pub side: Side,
}

impl Tick {
    pub fn new(
        timestamp_ms: i64,
        market_id: impl Into<String>,
        price: f64,
        size: f64,
        side: Side,
    ) -> Self {
        Self {
            timestamp_ms,
            market_id: market_id.into(),
            price,
            size,
            volume: price * size,
            side,
        }
    }
}

/// One price level of an orderbook side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
}

impl BookLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }

    /// Notional at this level.
    pub fn volume(&self) -> f64 {
        self.price * self.size
    }
}

/// Full L2 snapshot for one market. Bids descending, asks ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub timestamp_ms: i64,
    pub market_id: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    /// best_ask - best_bid, always >= 0 (0 when locked).
    pub spread: f64,
    pub mid_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
}

impl OrderbookSnapshot {
    /// Build a snapshot from raw levels, sorting sides into canonical order.
    pub fn new(
        timestamp_ms: i64,
        market_id: impl Into<String>,
        mut bids: Vec<BookLevel>,
        mut asks: Vec<BookLevel>,
    ) -> Self {
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

        let best_bid = bids.first().map(|l| l.price).unwrap_or(0.0);
        let best_ask = asks.first().map(|l| l.price).unwrap_or(0.0);
        let (spread, mid_price) = if best_bid > 0.0 && best_ask > 0.0 {
            ((best_ask - best_bid).max(0.0), (best_bid + best_ask) / 2.0)
        } else {
            (0.0, best_bid.max(best_ask))
        };

        Self {
            timestamp_ms,
            market_id: market_id.into(),
            bids,
            asks,
            spread,
            mid_price,
            best_bid,
            best_ask,
        }
    }

    pub fn total_bid_volume(&self) -> f64 {
        self.bids.iter().map(|l| l.volume()).sum()
    }

    pub fn total_ask_volume(&self) -> f64 {
        self.asks.iter().map(|l| l.volume()).sum()
    }

    pub fn total_bid_size(&self) -> f64 {
        self.bids.iter().map(|l| l.size).sum()
    }

    pub fn total_ask_size(&self) -> f64 {
        self.asks.iter().map(|l| l.size).sum()
    }

    /// Total level count on both sides.
    pub fn depth(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    /// Size-weighted mid: (bid_size * ask + ask_size * bid) / (bid_size + ask_size).
    pub fn micro_price(&self) -> Option<f64> {
        let bid = self.bids.first()?;
        let ask = self.asks.first()?;
        let denom = bid.size + ask.size;
        if denom <= 0.0 {
            return None;
        }
        Some((bid.size * ask.price + ask.size * bid.price) / denom)
    }
}

/// Down-sampled price observation for longer-horizon series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp_ms: i64,
    pub price: f64,
    pub volume: f64,
    #[serde(default)]
    pub spread: Option<f64>,
}

/// Signal severity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// How quickly a flow-based signal is expected to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Immediate,
    Short,
    Medium,
}

/// Closed set of early-signal kinds. The sink pattern-matches on this;
/// per-kind context travels in `EarlySignal::metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    OrderbookImbalance,
    SpreadAnomaly,
    MarketMakerWithdrawal,
    MomentumBreakout,
    LiquidityShift,
    NewMarket,
    VolumeSpike,
    PriceMovement,
    UnusualActivity,
    AggressiveBuyer,
    AggressiveSeller,
    IcebergDetected,
    WallBreak,
    LiquidityVacuum,
    SmartMoney,
    StopHunt,
    InformationLeak,
    CoordinatedCrossMarket,
    OffHoursAnomaly,
    StealthAccumulation,
    MicroPriceDrift,
    FrontRunningDetected,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::OrderbookImbalance => "orderbook_imbalance",
            SignalKind::SpreadAnomaly => "spread_anomaly",
            SignalKind::MarketMakerWithdrawal => "market_maker_withdrawal",
            SignalKind::MomentumBreakout => "momentum_breakout",
            SignalKind::LiquidityShift => "liquidity_shift",
            SignalKind::NewMarket => "new_market",
            SignalKind::VolumeSpike => "volume_spike",
            SignalKind::PriceMovement => "price_movement",
            SignalKind::UnusualActivity => "unusual_activity",
            SignalKind::AggressiveBuyer => "aggressive_buyer",
            SignalKind::AggressiveSeller => "aggressive_seller",
            SignalKind::IcebergDetected => "iceberg_detected",
            SignalKind::WallBreak => "wall_break",
            SignalKind::LiquidityVacuum => "liquidity_vacuum",
            SignalKind::SmartMoney => "smart_money",
            SignalKind::StopHunt => "stop_hunt",
            SignalKind::InformationLeak => "information_leak",
            SignalKind::CoordinatedCrossMarket => "coordinated_cross_market",
            SignalKind::OffHoursAnomaly => "off_hours_anomaly",
            SignalKind::StealthAccumulation => "stealth_accumulation",
            SignalKind::MicroPriceDrift => "micro_price_drift",
            SignalKind::FrontRunningDetected => "front_running_detected",
        }
    }

    /// Kinds produced by the per-frame microstructure path, as opposed to
    /// the coarse catalog scan. The sink receives these on a separate hook.
    pub fn is_microstructure(&self) -> bool {
        !matches!(
            self,
            SignalKind::NewMarket
                | SignalKind::VolumeSpike
                | SignalKind::PriceMovement
                | SignalKind::UnusualActivity
                | SignalKind::CoordinatedCrossMarket
        )
    }
}

/// A detected anomaly, transferred by value to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlySignal {
    pub market_id: String,
    pub kind: SignalKind,
    pub timestamp_ms: i64,
    /// Detection confidence in [0, 1].
    pub confidence: f64,
    pub severity: Severity,
    pub description: String,
    /// Kind-specific context plus enrichment added by the orchestrator.
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_horizon: Option<TimeHorizon>,
}

impl EarlySignal {
    pub fn new(
        market_id: impl Into<String>,
        kind: SignalKind,
        timestamp_ms: i64,
        confidence: f64,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            kind,
            timestamp_ms,
            confidence: confidence.clamp(0.0, 1.0),
            severity,
            description: description.into(),
            metadata: serde_json::Value::Null,
            time_horizon: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_horizon(mut self, horizon: TimeHorizon) -> Self {
        self.time_horizon = Some(horizon);
        self
    }

    /// Merge extra keys into the metadata map without clobbering existing ones.
    pub fn merge_metadata(&mut self, extra: serde_json::Value) {
        match (&mut self.metadata, extra) {
            (serde_json::Value::Object(existing), serde_json::Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.entry(k).or_insert(v);
                }
            }
            (slot @ serde_json::Value::Null, incoming) => *slot = incoming,
            _ => {}
        }
    }
}

/// One catalog entry as supplied by the external market-catalog collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogMarket {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub outcome_prices: Vec<f64>,
    /// Cumulative 24h notional volume.
    #[serde(default, deserialize_with = "de_f64_default")]
    pub volume_24h: f64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Events flowing from the stream ingestor into the orchestrator.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Tick(Tick),
    Book(OrderbookSnapshot),
}

impl MarketEvent {
    pub fn market_id(&self) -> &str {
        match self {
            MarketEvent::Tick(t) => &t.market_id,
            MarketEvent::Book(b) => &b.market_id,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            MarketEvent::Tick(t) => t.timestamp_ms,
            MarketEvent::Book(b) => b.timestamp_ms,
        }
    }
}

/// Accept both `0.52` and `"0.52"` for price fields. Exchanges disagree.
pub fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom("invalid float string")),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

fn de_f64_default<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Null => Ok(0.0),
        serde_json::Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Ok(s.parse::<f64>().unwrap_or(0.0)),
        _ => Ok(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sorts_sides_and_computes_spread() {
        let snapshot = OrderbookSnapshot::new(
            1_700_000_000_000,
            "mkt-a",
            vec![BookLevel::new(0.010, 100.0), BookLevel::new(0.011, 50.0)],
            vec![BookLevel::new(0.040, 80.0), BookLevel::new(0.038, 20.0)],
        );

        assert_eq!(snapshot.best_bid, 0.011);
        assert_eq!(snapshot.best_ask, 0.038);
        assert!((snapshot.spread - 0.027).abs() < 1e-12);
        assert!((snapshot.mid_price - 0.0245).abs() < 1e-12);
        assert!(snapshot.bids[0].price > snapshot.bids[1].price);
        assert!(snapshot.asks[0].price < snapshot.asks[1].price);
    }

    #[test]
    fn micro_price_weights_by_opposite_size() {
        let snapshot = OrderbookSnapshot::new(
            0,
            "mkt-a",
            vec![BookLevel::new(0.40, 300.0)],
            vec![BookLevel::new(0.44, 100.0)],
        );

        // (300 * 0.44 + 100 * 0.40) / 400 = 0.43
        let mp = snapshot.micro_price().unwrap();
        assert!((mp - 0.43).abs() < 1e-12);
    }

    #[test]
    fn book_level_accepts_string_prices() {
        let level: BookLevel = serde_json::from_str(r#"{"price": "0.52", "size": "10"}"#).unwrap();
        assert_eq!(level.price, 0.52);
        assert_eq!(level.size, 10.0);
    }

    #[test]
    fn merge_metadata_keeps_existing_keys() {
        let mut signal =
            EarlySignal::new("m", SignalKind::VolumeSpike, 0, 0.9, Severity::Medium, "spike")
                .with_metadata(serde_json::json!({"volume_change_pct": 20.0}));
        signal.merge_metadata(serde_json::json!({"volume_change_pct": 99.0, "detected_at_ms": 1}));

        assert_eq!(signal.metadata["volume_change_pct"], 20.0);
        assert_eq!(signal.metadata["detected_at_ms"], 1);
    }
}
