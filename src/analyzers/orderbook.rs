//! Per-snapshot orderbook metrics and baseline-relative book anomalies.

use std::collections::HashMap;

use serde::Serialize;

use crate::buffers::{OrderbookBuffer, RingBuffer};
use crate::config::SharedConfig;
use crate::models::{EarlySignal, OrderbookSnapshot, Severity, SignalKind};
use crate::spread::{spread_bps, spread_percent};
use crate::stats::{mean_std, severity_for};

/// Snapshots required before baseline-relative signals fire.
const MIN_SNAPSHOTS: usize = 10;
/// Baseline window and its minimum population.
const BASELINE_WINDOW_MS: i64 = 5 * 60 * 1000;
const MIN_BASELINE_SNAPSHOTS: usize = 5;
/// Depth/volume contraction that counts as a maker pulling out, percent.
const WITHDRAWAL_PCT: f64 = 30.0;
/// Bid/ask volume ratio is capped to keep one empty side from exploding it.
const RATIO_CAP: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct BookMetrics {
    pub timestamp_ms: i64,
    pub total_bid_volume: f64,
    pub total_ask_volume: f64,
    pub bid_ask_ratio: f64,
    pub depth_imbalance: f64,
    pub liquidity_score: f64,
    pub spread: f64,
    pub spread_bps: f64,
    pub spread_percent: f64,
    pub mid_price: f64,
    pub depth_levels: usize,
}

impl BookMetrics {
    pub fn compute(snapshot: &OrderbookSnapshot) -> Self {
        let total_bid_volume = snapshot.total_bid_volume();
        let total_ask_volume = snapshot.total_ask_volume();
        let bid_ask_ratio = if total_ask_volume > 0.0 {
            (total_bid_volume / total_ask_volume).min(RATIO_CAP)
        } else if total_bid_volume > 0.0 {
            RATIO_CAP
        } else {
            1.0
        };

        Self {
            timestamp_ms: snapshot.timestamp_ms,
            total_bid_volume,
            total_ask_volume,
            bid_ask_ratio,
            depth_imbalance: depth_imbalance(snapshot),
            liquidity_score: liquidity_score(snapshot),
            spread: snapshot.spread,
            spread_bps: spread_bps(snapshot.spread),
            spread_percent: spread_percent(snapshot.spread),
            mid_price: snapshot.mid_price,
            depth_levels: snapshot.depth(),
        }
    }
}

/// Depth-weighted imbalance in [-1, 1]. Level i contributes with weight
/// 1/(i+1), so the touch dominates but the tail still counts.
fn depth_imbalance(snapshot: &OrderbookSnapshot) -> f64 {
    let weighted = |levels: &[crate::models::BookLevel]| -> f64 {
        levels
            .iter()
            .enumerate()
            .map(|(i, l)| l.volume() / (i + 1) as f64)
            .sum()
    };
    let bid = weighted(&snapshot.bids);
    let ask = weighted(&snapshot.asks);
    let total = bid + ask;
    if total <= 0.0 {
        return 0.0;
    }
    (bid - ask) / total
}

/// Composite liquidity score in [0, 100].
///
/// The spread penalty is computed from the absolute spread; dividing by
/// best_ask would punish low-probability markets for their price level.
fn liquidity_score(snapshot: &OrderbookSnapshot) -> f64 {
    let total_volume = snapshot.total_bid_volume() + snapshot.total_ask_volume();
    let depth = snapshot.depth() as f64;
    let base = (total_volume / 1000.0 + depth * 2.0).min(100.0);
    let spread_penalty = spread_bps(snapshot.spread) / 100.0 * 10.0;
    (base - spread_penalty).max(0.0)
}

struct MarketBookState {
    books: OrderbookBuffer,
    metrics_history: RingBuffer<BookMetrics>,
    last_metrics: Option<BookMetrics>,
    last_seen_ms: i64,
}

impl MarketBookState {
    fn new(capacity: usize) -> Self {
        Self {
            books: OrderbookBuffer::new(capacity),
            metrics_history: RingBuffer::new(capacity),
            last_metrics: None,
            last_seen_ms: 0,
        }
    }
}

pub struct BookAnalysis {
    pub metrics: BookMetrics,
    pub signals: Vec<EarlySignal>,
}

/// Orderbook anomaly analyzer (C4).
pub struct OrderbookAnalyzer {
    config: SharedConfig,
    markets: HashMap<String, MarketBookState>,
}

impl OrderbookAnalyzer {
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
            .map(|m| m.books.len() + m.metrics_history.len())
            .sum()
    }

    pub fn latest_metrics(&self, market_id: &str) -> Option<&BookMetrics> {
        self.markets.get(market_id)?.last_metrics.as_ref()
    }

    pub fn analyze(&mut self, snapshot: &OrderbookSnapshot) -> BookAnalysis {
        let config = self.config.load();
        let state = self
            .markets
            .entry(snapshot.market_id.clone())
            .or_insert_with(|| MarketBookState::new(config.microstructure.book_buffer_size));

        state.last_seen_ms = snapshot.timestamp_ms;
        let metrics = BookMetrics::compute(snapshot);

        // Baselines are taken over history *before* this snapshot lands, so
        // the current observation never scores against itself.
        let signals = if state.metrics_history.len() >= MIN_SNAPSHOTS {
            let baseline: Vec<&BookMetrics> = state
                .metrics_history
                .since(snapshot.timestamp_ms - BASELINE_WINDOW_MS, |m| m.timestamp_ms);
            if baseline.len() >= MIN_BASELINE_SNAPSHOTS {
                let spread_baseline = state
                    .books
                    .avg_spread(BASELINE_WINDOW_MS)
                    .zip(state.books.spread_volatility(BASELINE_WINDOW_MS));
                book_signals(
                    snapshot,
                    &metrics,
                    &baseline,
                    spread_baseline,
                    &config.microstructure,
                )
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        state.books.push(snapshot.clone());
        state.metrics_history.push(metrics.clone());
        state.last_metrics = Some(metrics.clone());

        BookAnalysis { metrics, signals }
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
                state.books.dispose();
                state.metrics_history.dispose();
            },
        )
    }

    pub fn aggressive_trim(&mut self, now_ms: i64, inactive_after_ms: i64, keep: usize) {
        for state in self.markets.values_mut() {
            if now_ms - state.last_seen_ms > inactive_after_ms {
                state.books.trim_to_size(keep);
                state.metrics_history.trim_to_size(keep);
            }
        }
    }

    pub fn dispose(&mut self) {
        for state in self.markets.values_mut() {
            state.books.dispose();
            state.metrics_history.dispose();
        }
        self.markets.clear();
    }
}

fn book_signals(
    snapshot: &OrderbookSnapshot,
    metrics: &BookMetrics,
    baseline: &[&BookMetrics],
    spread_baseline: Option<(f64, f64)>,
    config: &crate::config::MicrostructureConfig,
) -> Vec<EarlySignal> {
    let mut signals = Vec::new();
    let market = snapshot.market_id.as_str();
    let ts = snapshot.timestamp_ms;

    let ratios: Vec<f64> = baseline.iter().map(|m| m.bid_ask_ratio).collect();
    let scores: Vec<f64> = baseline.iter().map(|m| m.liquidity_score).collect();
    let volumes: Vec<f64> = baseline
        .iter()
        .map(|m| m.total_bid_volume + m.total_ask_volume)
        .collect();
    let depths: Vec<f64> = baseline.iter().map(|m| m.depth_levels as f64).collect();

    if let Some((baseline_ratio, _)) = mean_std(&ratios) {
        let deviation = (metrics.bid_ask_ratio - baseline_ratio).abs();
        if deviation > config.orderbook_imbalance_threshold {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::OrderbookImbalance,
                    ts,
                    (deviation / config.orderbook_imbalance_threshold).min(0.9),
                    severity_for(deviation, config.orderbook_imbalance_threshold),
                    format!(
                        "bid/ask ratio {:.2} vs baseline {:.2}",
                        metrics.bid_ask_ratio, baseline_ratio
                    ),
                )
                .with_metadata(serde_json::json!({
                    "bid_ask_ratio": metrics.bid_ask_ratio,
                    "baseline_ratio": baseline_ratio,
                    "deviation": deviation,
                })),
            );
        }
    }

    if let Some((avg_spread, spread_vol)) = spread_baseline {
        if spread_vol > f64::EPSILON {
            let z = (metrics.spread - avg_spread).abs() / spread_vol;
            if z > config.spread_anomaly_threshold {
                signals.push(
                    EarlySignal::new(
                        market,
                        SignalKind::SpreadAnomaly,
                        ts,
                        (z / config.spread_anomaly_threshold).min(0.95),
                        severity_for(z, config.spread_anomaly_threshold),
                        format!(
                            "spread {:.4} is {z:.1} sigma from baseline {avg_spread:.4}",
                            metrics.spread
                        ),
                    )
                    .with_metadata(serde_json::json!({
                        "spread": metrics.spread,
                        "spread_bps": metrics.spread_bps,
                        "baseline_spread": avg_spread,
                        "z_score": z,
                    })),
                );
            }
        }
    }

    if let (Some((avg_depth, _)), Some((avg_volume, _))) = (mean_std(&depths), mean_std(&volumes)) {
        if avg_depth > 0.0 && avg_volume > 0.0 {
            let depth_drop = (1.0 - metrics.depth_levels as f64 / avg_depth) * 100.0;
            let volume_drop =
                (1.0 - (metrics.total_bid_volume + metrics.total_ask_volume) / avg_volume) * 100.0;
            if depth_drop > WITHDRAWAL_PCT && volume_drop > WITHDRAWAL_PCT {
                let magnitude = depth_drop.min(volume_drop);
                signals.push(
                    EarlySignal::new(
                        market,
                        SignalKind::MarketMakerWithdrawal,
                        ts,
                        (magnitude / WITHDRAWAL_PCT).min(0.95),
                        if magnitude > 60.0 {
                            Severity::High
                        } else {
                            Severity::Medium
                        },
                        format!(
                            "depth -{depth_drop:.0}% and volume -{volume_drop:.0}% vs 5m baseline"
                        ),
                    )
                    .with_metadata(serde_json::json!({
                        "depth_drop_pct": depth_drop,
                        "volume_drop_pct": volume_drop,
                        "depth_levels": metrics.depth_levels,
                        "baseline_depth": avg_depth,
                    })),
                );
            }
        }
    }

    if let Some((avg_score, _)) = mean_std(&scores) {
        let shift = (metrics.liquidity_score - avg_score).abs();
        if shift > config.liquidity_shift_threshold {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::LiquidityShift,
                    ts,
                    (shift / config.liquidity_shift_threshold).min(0.9),
                    severity_for(shift, config.liquidity_shift_threshold),
                    format!(
                        "liquidity score moved {shift:.0} points from baseline {avg_score:.0}"
                    ),
                )
                .with_metadata(serde_json::json!({
                    "liquidity_score": metrics.liquidity_score,
                    "baseline_score": avg_score,
                    "shift": shift,
                })),
            );
        }
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::BookLevel;

    fn analyzer() -> OrderbookAnalyzer {
        OrderbookAnalyzer::new(SharedConfig::new(EngineConfig::default()))
    }

    fn book(ts: i64, bid: f64, ask: f64, size: f64) -> OrderbookSnapshot {
        OrderbookSnapshot::new(
            ts,
            "mkt",
            vec![
                BookLevel::new(bid, size),
                BookLevel::new(bid - 0.01, size),
                BookLevel::new(bid - 0.02, size),
            ],
            vec![
                BookLevel::new(ask, size),
                BookLevel::new(ask + 0.01, size),
                BookLevel::new(ask + 0.02, size),
            ],
        )
    }

    #[test]
    fn spread_component_is_price_level_independent() {
        // Same absolute spread at different probability levels must produce
        // identical spread metrics and liquidity-score penalties.
        let low = BookMetrics::compute(&book(0, 0.10, 0.15, 100.0));
        let mid = BookMetrics::compute(&book(0, 0.45, 0.50, 100.0));
        let high = BookMetrics::compute(&book(0, 0.85, 0.90, 100.0));

        assert!((low.spread_bps - mid.spread_bps).abs() < 1.0);
        assert!((mid.spread_bps - high.spread_bps).abs() < 1.0);
        assert!((low.spread_percent - high.spread_percent).abs() < 1e-9);
    }

    #[test]
    fn balanced_book_has_zero_depth_imbalance() {
        let snapshot = book(0, 0.48, 0.52, 50.0);
        let metrics = BookMetrics::compute(&snapshot);
        // Volumes differ slightly because bid and ask prices differ, but the
        // imbalance must be small and symmetric around zero.
        assert!(metrics.depth_imbalance.abs() < 0.1);
    }

    #[test]
    fn one_sided_book_saturates_ratio() {
        let snapshot = OrderbookSnapshot::new(
            0,
            "mkt",
            vec![BookLevel::new(0.40, 500.0)],
            vec![],
        );
        let metrics = BookMetrics::compute(&snapshot);
        assert_eq!(metrics.bid_ask_ratio, RATIO_CAP);
    }

    #[test]
    fn no_signals_before_min_history() {
        let mut analyzer = analyzer();
        for i in 0..(MIN_SNAPSHOTS - 1) {
            let analysis = analyzer.analyze(&book(i as i64 * 10_000, 0.48, 0.52, 100.0));
            assert!(analysis.signals.is_empty());
        }
    }

    #[test]
    fn imbalance_against_baseline_fires() {
        let mut analyzer = analyzer();
        // Stable baseline.
        for i in 0..15 {
            analyzer.analyze(&book(i * 10_000, 0.48, 0.52, 100.0));
        }
        // Bid side triples while asks stay put.
        let skewed = OrderbookSnapshot::new(
            160_000,
            "mkt",
            vec![BookLevel::new(0.48, 600.0), BookLevel::new(0.47, 600.0)],
            vec![BookLevel::new(0.52, 100.0), BookLevel::new(0.53, 100.0)],
        );
        let analysis = analyzer.analyze(&skewed);

        assert!(
            analysis
                .signals
                .iter()
                .any(|s| s.kind == SignalKind::OrderbookImbalance),
            "expected an imbalance signal, got {:?}",
            analysis.signals
        );
    }

    #[test]
    fn maker_withdrawal_needs_both_depth_and_volume_drop() {
        let mut analyzer = analyzer();
        for i in 0..15 {
            analyzer.analyze(&book(i * 10_000, 0.48, 0.52, 100.0));
        }
        // Book collapses to a single thin level per side.
        let thin = OrderbookSnapshot::new(
            160_000,
            "mkt",
            vec![BookLevel::new(0.48, 10.0)],
            vec![BookLevel::new(0.52, 10.0)],
        );
        let analysis = analyzer.analyze(&thin);

        assert!(analysis
            .signals
            .iter()
            .any(|s| s.kind == SignalKind::MarketMakerWithdrawal));
    }

    #[test]
    fn liquidity_score_clamps_at_zero() {
        // Huge spread wipes out a thin book's score.
        let snapshot = OrderbookSnapshot::new(
            0,
            "mkt",
            vec![BookLevel::new(0.05, 1.0)],
            vec![BookLevel::new(0.95, 1.0)],
        );
        assert_eq!(liquidity_score(&snapshot), 0.0);
    }
}
