//! Multi-level order-flow pressure and the predatory-flow heuristics.
//!
//! All pressure terms are computed from level *size*, never size times
//! price. Price here is a probability: weighting by it would make a 0.90
//! market look five times heavier than an identically-stacked 0.18 market.

use std::collections::HashMap;

use serde::Serialize;

use crate::buffers::{RingBuffer, TickBuffer};
use crate::config::SharedConfig;
use crate::models::{
    BookLevel, EarlySignal, OrderbookSnapshot, SignalKind, Tick, TimeHorizon,
};
use crate::spread::spread_tightness_default;
use crate::stats::{mean_std, severity_for};

/// Trades kept per market for size-distribution heuristics.
const TRADE_BUFFER: usize = 200;
/// Trade window feeding those heuristics.
const TRADE_WINDOW_MS: i64 = 5 * 60 * 1000;
/// Book-size history for the liquidity ratio.
const SIZE_HISTORY: usize = 30;

/// Signal thresholds from the detection table.
const AGGRESSOR_IMBALANCE: f64 = 0.6;
const ICEBERG_PROBABILITY: f64 = 0.7;
const WALL_STRENGTH: f64 = 0.6;
const WALL_VELOCITY: f64 = 0.3;
const VACUUM_LIQUIDITY_RATIO: f64 = 0.2;
const VACUUM_MM_PRESENCE: f64 = 0.3;
const SMART_MONEY_L5: f64 = 0.5;
const SMART_MONEY_MM: f64 = 0.4;
const SMART_MONEY_SIZE_DISTR: f64 = 3.0;
const STOP_HUNT_ACCEL: f64 = 0.4;
const STOP_HUNT_LIQ_RISK: f64 = 0.6;

/// Top-level stability term of the iceberg score. Fixed placeholder until
/// per-level refill history is available to compare against.
const TOP_LEVEL_STABILITY: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct FlowMetrics {
    pub timestamp_ms: i64,
    /// Size imbalance at the touch, in [-1, 1].
    pub imbalance_top: f64,
    pub imbalance_l2: f64,
    pub imbalance_l5: f64,
    /// Distance-weighted size imbalance, weight 1/(1 + |price - mid| * 100).
    pub weighted_imbalance: f64,
    /// Normalized weighted pressure per side; bid + ask = 1 when the book
    /// is populated.
    pub bid_pressure: f64,
    pub ask_pressure: f64,
    pub net_pressure: f64,
    /// Change of top-of-book imbalance since the previous snapshot.
    pub flow_velocity: f64,
    /// Change of net pressure since the previous snapshot.
    pub pressure_acceleration: f64,
    pub spread_tightness: f64,
    /// Absolute spread. Not divided by mid; see module docs.
    pub relative_spread: f64,
    /// 1 when the top-3 sizes per side look machine-uniform.
    pub mm_presence: f64,
    /// max/avg trade size over the recent window.
    pub size_distribution: f64,
    pub iceberg_probability: f64,
    pub wall_strength: f64,
    pub liquidation_risk: f64,
    /// Current book size vs its rolling average.
    pub liquidity_ratio: f64,
}

#[derive(Debug, Clone, Copy)]
struct PrevBook {
    imbalance_top: f64,
    net_pressure: f64,
    mid: f64,
    spread: f64,
}

struct MarketFlowState {
    trades: TickBuffer,
    size_history: RingBuffer<f64>,
    prev: Option<PrevBook>,
    last_metrics: Option<FlowMetrics>,
    last_seen_ms: i64,
}

impl MarketFlowState {
    fn new() -> Self {
        Self {
            trades: TickBuffer::new(TRADE_BUFFER),
            size_history: RingBuffer::new(SIZE_HISTORY),
            prev: None,
            last_metrics: None,
            last_seen_ms: 0,
        }
    }
}

fn size_imbalance(bids: &[BookLevel], asks: &[BookLevel], levels: usize) -> f64 {
    let bid: f64 = bids.iter().take(levels).map(|l| l.size).sum();
    let ask: f64 = asks.iter().take(levels).map(|l| l.size).sum();
    let total = bid + ask;
    if total <= 0.0 {
        return 0.0;
    }
    (bid - ask) / total
}

fn weighted_side(levels: &[BookLevel], mid: f64) -> f64 {
    levels
        .iter()
        .map(|l| l.size / (1.0 + (l.price - mid).abs() * 100.0))
        .sum()
}

/// Coefficient-of-variation uniformity of the top-3 sizes on one side.
fn side_uniformity(levels: &[BookLevel]) -> f64 {
    let sizes: Vec<f64> = levels.iter().take(3).map(|l| l.size).collect();
    if sizes.len() < 2 {
        return 0.0;
    }
    match mean_std(&sizes) {
        Some((mean, sd)) if mean > 0.0 => (1.0 - sd / mean).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn wall_strength(levels: &[BookLevel]) -> f64 {
    let Some(top) = levels.first() else {
        return 0.0;
    };
    if top.size <= 0.0 {
        return 0.0;
    }
    levels
        .iter()
        .skip(1)
        .map(|l| (l.size / (3.0 * top.size)).min(1.0))
        .fold(0.0, f64::max)
}

pub struct FlowUpdate {
    pub metrics: FlowMetrics,
    pub signals: Vec<EarlySignal>,
}

/// Order-flow analyzer (C6).
pub struct OrderFlowAnalyzer {
    config: SharedConfig,
    markets: HashMap<String, MarketFlowState>,
}

impl OrderFlowAnalyzer {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            markets: HashMap::new(),
        }
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub fn buffered_points(&self) -> usize {
        self.markets
            .values()
            .map(|m| m.trades.len() + m.size_history.len())
            .sum()
    }

    pub fn latest_metrics(&self, market_id: &str) -> Option<&FlowMetrics> {
        self.markets.get(market_id)?.last_metrics.as_ref()
    }

    /// Record a trade for the size-distribution heuristics.
    pub fn on_tick(&mut self, tick: &Tick) {
        let state = self
            .markets
            .entry(tick.market_id.clone())
            .or_insert_with(MarketFlowState::new);
        state.trades.push(tick.clone());
        state.last_seen_ms = tick.timestamp_ms;
    }

    pub fn analyze(&mut self, snapshot: &OrderbookSnapshot) -> FlowUpdate {
        let state = self
            .markets
            .entry(snapshot.market_id.clone())
            .or_insert_with(MarketFlowState::new);
        state.last_seen_ms = snapshot.timestamp_ms;

        let mid = snapshot.mid_price;
        let imbalance_top = size_imbalance(&snapshot.bids, &snapshot.asks, 1);
        let imbalance_l2 = size_imbalance(&snapshot.bids, &snapshot.asks, 2);
        let imbalance_l5 = size_imbalance(&snapshot.bids, &snapshot.asks, 5);

        let w_bid = weighted_side(&snapshot.bids, mid);
        let w_ask = weighted_side(&snapshot.asks, mid);
        let w_total = w_bid + w_ask;
        let (bid_pressure, ask_pressure) = if w_total > 0.0 {
            (w_bid / w_total, w_ask / w_total)
        } else {
            (0.5, 0.5)
        };
        let net_pressure = bid_pressure - ask_pressure;
        let weighted_imbalance = net_pressure;

        let (flow_velocity, pressure_acceleration, prev_mid, prev_spread) = match state.prev {
            Some(prev) => (
                imbalance_top - prev.imbalance_top,
                net_pressure - prev.net_pressure,
                prev.mid,
                prev.spread,
            ),
            None => (0.0, 0.0, mid, snapshot.spread),
        };

        let mm_presence =
            (side_uniformity(&snapshot.bids) + side_uniformity(&snapshot.asks)) / 2.0;

        let (avg_trade, max_trade) = state
            .trades
            .size_stats(TRADE_WINDOW_MS)
            .unwrap_or((0.0, 0.0));
        let size_distribution = if avg_trade > 0.0 { max_trade / avg_trade } else { 1.0 };

        let total_size = snapshot.total_bid_size() + snapshot.total_ask_size();
        let liquidity_ratio = {
            let sizes: Vec<f64> = state.size_history.iter().copied().collect();
            match mean_std(&sizes) {
                Some((mean, _)) if mean > 0.0 => (total_size / mean).min(2.0),
                _ => 1.0,
            }
        };
        state.size_history.push(total_size);

        // Impact factor: large prints that barely move the mid hint at
        // hidden size refilling behind the touch.
        let impact = if snapshot.spread > 0.0 {
            ((mid - prev_mid).abs() / snapshot.spread).min(1.0)
        } else {
            1.0
        };
        let large_share = {
            let trades = state.trades.window(TRADE_WINDOW_MS);
            if trades.is_empty() || avg_trade <= 0.0 {
                0.0
            } else {
                trades.iter().filter(|t| t.size > 2.0 * avg_trade).count() as f64
                    / trades.len() as f64
            }
        };
        let iceberg_probability = if large_share > 0.0 {
            (large_share * 0.5 + (1.0 - impact) * 0.3 + TOP_LEVEL_STABILITY * 0.4).min(1.0)
        } else {
            0.0
        };

        let wall = wall_strength(&snapshot.bids).max(wall_strength(&snapshot.asks));

        let spread_widening = if prev_spread > 0.0 {
            (((snapshot.spread - prev_spread) / prev_spread * 100.0) / 50.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let liquidation_risk = ((1.0 - liquidity_ratio.min(1.0)) * 0.4
            + (size_distribution / 5.0).min(1.0) * 0.3
            + spread_widening * 0.3)
            .clamp(0.0, 1.0);

        state.prev = Some(PrevBook {
            imbalance_top,
            net_pressure,
            mid,
            spread: snapshot.spread,
        });

        let metrics = FlowMetrics {
            timestamp_ms: snapshot.timestamp_ms,
            imbalance_top,
            imbalance_l2,
            imbalance_l5,
            weighted_imbalance,
            bid_pressure,
            ask_pressure,
            net_pressure,
            flow_velocity,
            pressure_acceleration,
            spread_tightness: spread_tightness_default(snapshot.spread),
            relative_spread: snapshot.spread,
            mm_presence,
            size_distribution,
            iceberg_probability,
            wall_strength: wall,
            liquidation_risk,
            liquidity_ratio,
        };

        let signals = flow_signals(&snapshot.market_id, &metrics);
        state.last_metrics = Some(metrics.clone());

        FlowUpdate { metrics, signals }
    }

    pub fn cleanup_stale_markets(&mut self, now_ms: i64) -> usize {
        let config = self.config.load();
        super::technical::cleanup_by_age_and_lru(
            &mut self.markets,
            now_ms,
            config.microstructure.max_age_ms,
            config.microstructure.max_markets,
            |state| state.last_seen_ms,
            |state| {
                state.trades.dispose();
                state.size_history.dispose();
            },
        )
    }

    pub fn aggressive_trim(&mut self, now_ms: i64, inactive_after_ms: i64, keep: usize) {
        for state in self.markets.values_mut() {
            if now_ms - state.last_seen_ms > inactive_after_ms {
                state.trades.trim_to_size(keep);
            }
        }
    }

    pub fn dispose(&mut self) {
        for state in self.markets.values_mut() {
            state.trades.dispose();
            state.size_history.dispose();
        }
        self.markets.clear();
    }
}

fn flow_signals(market: &str, m: &FlowMetrics) -> Vec<EarlySignal> {
    let mut signals = Vec::new();
    let ts = m.timestamp_ms;

    if m.weighted_imbalance.abs() > AGGRESSOR_IMBALANCE {
        let (kind, side) = if m.weighted_imbalance > 0.0 {
            (SignalKind::AggressiveBuyer, "bid")
        } else {
            (SignalKind::AggressiveSeller, "ask")
        };
        signals.push(
            EarlySignal::new(
                market,
                kind,
                ts,
                (m.weighted_imbalance.abs() / AGGRESSOR_IMBALANCE).min(0.9),
                severity_for(m.weighted_imbalance, AGGRESSOR_IMBALANCE),
                format!(
                    "{side} side carrying {:.0}% of weighted book pressure",
                    m.weighted_imbalance.abs() * 100.0
                ),
            )
            .with_metadata(serde_json::json!({
                "weighted_imbalance": m.weighted_imbalance,
                "imbalance_top": m.imbalance_top,
            }))
            .with_horizon(TimeHorizon::Immediate),
        );
    }

    if m.iceberg_probability > ICEBERG_PROBABILITY {
        signals.push(
            EarlySignal::new(
                market,
                SignalKind::IcebergDetected,
                ts,
                m.iceberg_probability.min(0.9),
                severity_for(m.iceberg_probability, ICEBERG_PROBABILITY),
                format!(
                    "iceberg pattern: large prints absorbing with {:.0}% probability",
                    m.iceberg_probability * 100.0
                ),
            )
            .with_metadata(serde_json::json!({
                "iceberg_probability": m.iceberg_probability,
                "size_distribution": m.size_distribution,
            }))
            .with_horizon(TimeHorizon::Short),
        );
    }

    if m.wall_strength > WALL_STRENGTH && m.flow_velocity.abs() > WALL_VELOCITY {
        signals.push(
            EarlySignal::new(
                market,
                SignalKind::WallBreak,
                ts,
                (m.wall_strength * m.flow_velocity.abs()).sqrt().min(0.9),
                severity_for(m.flow_velocity, WALL_VELOCITY),
                format!(
                    "flow shifting {:+.2} into a {:.0}%-strength wall",
                    m.flow_velocity,
                    m.wall_strength * 100.0
                ),
            )
            .with_metadata(serde_json::json!({
                "wall_strength": m.wall_strength,
                "flow_velocity": m.flow_velocity,
            }))
            .with_horizon(TimeHorizon::Immediate),
        );
    }

    if m.liquidity_ratio < VACUUM_LIQUIDITY_RATIO && m.mm_presence < VACUUM_MM_PRESENCE {
        signals.push(
            EarlySignal::new(
                market,
                SignalKind::LiquidityVacuum,
                ts,
                (1.0 - m.liquidity_ratio / VACUUM_LIQUIDITY_RATIO).min(0.9),
                crate::models::Severity::High,
                format!(
                    "book at {:.0}% of normal size with makers absent",
                    m.liquidity_ratio * 100.0
                ),
            )
            .with_metadata(serde_json::json!({
                "liquidity_ratio": m.liquidity_ratio,
                "mm_presence": m.mm_presence,
            }))
            .with_horizon(TimeHorizon::Immediate),
        );
    }

    if m.imbalance_l5.abs() > SMART_MONEY_L5
        && m.mm_presence < SMART_MONEY_MM
        && m.size_distribution > SMART_MONEY_SIZE_DISTR
    {
        signals.push(
            EarlySignal::new(
                market,
                SignalKind::SmartMoney,
                ts,
                (m.imbalance_l5.abs() / SMART_MONEY_L5).min(0.9),
                severity_for(m.imbalance_l5, SMART_MONEY_L5),
                format!(
                    "outsized prints into a {:+.2} deep-book imbalance without maker support",
                    m.imbalance_l5
                ),
            )
            .with_metadata(serde_json::json!({
                "imbalance_l5": m.imbalance_l5,
                "mm_presence": m.mm_presence,
                "size_distribution": m.size_distribution,
            }))
            .with_horizon(TimeHorizon::Medium),
        );
    }

    if m.pressure_acceleration.abs() > STOP_HUNT_ACCEL && m.liquidation_risk > STOP_HUNT_LIQ_RISK {
        signals.push(
            EarlySignal::new(
                market,
                SignalKind::StopHunt,
                ts,
                (m.liquidation_risk * m.pressure_acceleration.abs()).sqrt().min(0.9),
                severity_for(m.pressure_acceleration, STOP_HUNT_ACCEL),
                format!(
                    "pressure snapping {:+.2} into a fragile book (liquidation risk {:.0}%)",
                    m.pressure_acceleration,
                    m.liquidation_risk * 100.0
                ),
            )
            .with_metadata(serde_json::json!({
                "pressure_acceleration": m.pressure_acceleration,
                "liquidation_risk": m.liquidation_risk,
            }))
            .with_horizon(TimeHorizon::Short),
        );
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::Side;

    fn analyzer() -> OrderFlowAnalyzer {
        OrderFlowAnalyzer::new(SharedConfig::new(EngineConfig::default()))
    }

    fn level(price: f64, size: f64) -> BookLevel {
        BookLevel::new(price, size)
    }

    #[test]
    fn pressure_is_invariant_under_price_translation() {
        // Identical size ladders at different probability levels.
        let sizes = [120.0, 80.0, 60.0, 40.0, 20.0];
        let build = |bid0: f64, ask0: f64| {
            let bids = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| level(bid0 - i as f64 * 0.01, *s))
                .collect();
            let asks = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| level(ask0 + i as f64 * 0.01, *s))
                .collect();
            OrderbookSnapshot::new(0, "mkt", bids, asks)
        };

        let mut a = analyzer();
        let mut b = analyzer();
        let low = a.analyze(&build(0.10, 0.12));
        let high = b.analyze(&build(0.80, 0.82));

        assert!((low.metrics.bid_pressure - high.metrics.bid_pressure).abs() < 1e-9);
        assert!((low.metrics.ask_pressure - high.metrics.ask_pressure).abs() < 1e-9);
        assert!((low.metrics.weighted_imbalance - high.metrics.weighted_imbalance).abs() < 1e-9);
    }

    #[test]
    fn symmetric_book_has_no_net_pressure() {
        let sizes = [100.0, 50.0, 25.0];
        let bids: Vec<BookLevel> = sizes
            .iter()
            .enumerate()
            .map(|(i, s)| level(0.48 - i as f64 * 0.01, *s))
            .collect();
        let asks: Vec<BookLevel> = sizes
            .iter()
            .enumerate()
            .map(|(i, s)| level(0.52 + i as f64 * 0.01, *s))
            .collect();

        let mut analyzer = analyzer();
        let update = analyzer.analyze(&OrderbookSnapshot::new(0, "mkt", bids, asks));
        assert!(update.metrics.net_pressure.abs() < 1e-9);
        assert!(update.metrics.imbalance_l5.abs() < 1e-9);
    }

    #[test]
    fn aggressive_buyer_fires_on_heavy_bid_book() {
        let mut analyzer = analyzer();
        let update = analyzer.analyze(&OrderbookSnapshot::new(
            0,
            "mkt",
            vec![level(0.48, 900.0), level(0.47, 900.0)],
            vec![level(0.52, 50.0), level(0.53, 50.0)],
        ));

        let aggressive = update
            .signals
            .iter()
            .find(|s| s.kind == SignalKind::AggressiveBuyer)
            .expect("aggressive buyer signal");
        assert_eq!(aggressive.time_horizon, Some(TimeHorizon::Immediate));
    }

    #[test]
    fn uniform_maker_sizes_read_as_presence() {
        let mut analyzer1 = analyzer();
        let update = analyzer1.analyze(&OrderbookSnapshot::new(
            0,
            "mkt",
            vec![level(0.48, 100.0), level(0.47, 100.0), level(0.46, 100.0)],
            vec![level(0.52, 100.0), level(0.51, 100.0), level(0.53, 100.0)],
        ));
        assert!(update.metrics.mm_presence > 0.95);

        let mut analyzer2 = analyzer();
        let update = analyzer2.analyze(&OrderbookSnapshot::new(
            0,
            "mkt",
            vec![level(0.48, 500.0), level(0.47, 10.0), level(0.46, 3.0)],
            vec![level(0.52, 2.0), level(0.53, 400.0), level(0.54, 9.0)],
        ));
        assert!(update.metrics.mm_presence < 0.5);
    }

    #[test]
    fn wall_strength_spots_stacked_levels() {
        let bids = vec![level(0.48, 50.0), level(0.47, 200.0)];
        let asks = vec![level(0.52, 50.0)];
        let mut analyzer = analyzer();
        let update = analyzer.analyze(&OrderbookSnapshot::new(0, "mkt", bids, asks));
        // 200 > 3 * 50, saturated wall.
        assert!((update.metrics.wall_strength - 1.0).abs() < 1e-9);
    }

    #[test]
    fn liquidity_ratio_tracks_book_shrinkage() {
        let mut analyzer = analyzer();
        for i in 0..20 {
            analyzer.analyze(&OrderbookSnapshot::new(
                i * 1000,
                "mkt",
                vec![level(0.48, 500.0)],
                vec![level(0.52, 500.0)],
            ));
        }
        let update = analyzer.analyze(&OrderbookSnapshot::new(
            21_000,
            "mkt",
            vec![level(0.48, 50.0)],
            vec![level(0.52, 50.0)],
        ));
        assert!(update.metrics.liquidity_ratio < 0.2);
    }

    #[test]
    fn size_distribution_needs_trades() {
        let mut analyzer = analyzer();
        analyzer.on_tick(&Tick::new(0, "mkt", 0.5, 10.0, Side::Buy));
        analyzer.on_tick(&Tick::new(1_000, "mkt", 0.5, 10.0, Side::Buy));
        analyzer.on_tick(&Tick::new(2_000, "mkt", 0.5, 50.0, Side::Buy));

        let update = analyzer.analyze(&OrderbookSnapshot::new(
            3_000,
            "mkt",
            vec![level(0.48, 100.0)],
            vec![level(0.52, 100.0)],
        ));
        // max 50 / avg 23.3 ~= 2.14
        assert!(update.metrics.size_distribution > 2.0);
    }
}
