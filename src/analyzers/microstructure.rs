//! Micro-price, baseline z-scores and the quieter anomalies.
//!
//! Two baselines per metric: a rolling window over recent snapshots and a
//! time-of-day baseline bucketed by UTC hour. A 3-sigma volume burst at 14:00
//! may be routine while the same burst at 03:00 is not. Observations are
//! scored against a baseline before being folded into it.

use std::collections::HashMap;

use chrono::{TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::buffers::RingBuffer;
use crate::config::SharedConfig;
use crate::models::{EarlySignal, OrderbookSnapshot, Severity, SignalKind};
use crate::spread::spread_bps;
use crate::stats::{confidence_from_z, linreg_slope, mean_std, EmaState, RollingStats};

/// Micro-prices kept for the slope regression.
const SLOPE_POINTS: usize = 20;
/// EMA period smoothing the slope into drift.
const DRIFT_EMA_PERIOD: usize = 8;
/// Rolling baseline window, samples.
const ROLLING_WINDOW: usize = 120;
/// Samples required before a rolling z-score is trusted.
const MIN_ROLLING_SAMPLES: usize = 20;
/// Depth collapse that upgrades a vacuum to critical, percent.
const VACUUM_CRITICAL_DROP_PCT: f64 = 60.0;
/// Spread stability band for stealth accumulation, percent.
const STEALTH_SPREAD_BAND_PCT: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct MicroMetrics {
    pub timestamp_ms: i64,
    pub hour_utc: u32,
    pub bid_depth_1: f64,
    pub ask_depth_1: f64,
    pub total_depth_1: f64,
    pub micro_price: Option<f64>,
    /// Micro-price slope, probability per second.
    pub micro_price_slope: Option<f64>,
    /// EMA-smoothed slope.
    pub micro_price_drift: Option<f64>,
    /// Top-of-book size imbalance in [-1, 1].
    pub imbalance: f64,
    pub spread: f64,
    pub spread_bps: f64,
    pub spread_change_pct: f64,
    pub depth_change_pct: f64,
    pub book_volume: f64,
    pub liquidity_vacuum: bool,
    pub volume_z: Option<f64>,
    pub depth_z: Option<f64>,
    pub spread_z: Option<f64>,
    pub imbalance_z: Option<f64>,
    pub tod_volume_z: Option<f64>,
    pub tod_depth_z: Option<f64>,
}

struct MarketMicroState {
    micro_prices: RingBuffer<(i64, f64)>,
    drift: EmaState,
    rolling_volume: RingBuffer<f64>,
    rolling_depth: RingBuffer<f64>,
    rolling_spread: RingBuffer<f64>,
    rolling_imbalance: RingBuffer<f64>,
    tod_volume: [RollingStats; 24],
    tod_depth: [RollingStats; 24],
    prev_depth_1: Option<f64>,
    prev_spread: Option<f64>,
    last_metrics: Option<MicroMetrics>,
    last_seen_ms: i64,
}

impl MarketMicroState {
    fn new() -> Self {
        Self {
            micro_prices: RingBuffer::new(SLOPE_POINTS),
            drift: EmaState::new(DRIFT_EMA_PERIOD),
            rolling_volume: RingBuffer::new(ROLLING_WINDOW),
            rolling_depth: RingBuffer::new(ROLLING_WINDOW),
            rolling_spread: RingBuffer::new(ROLLING_WINDOW),
            rolling_imbalance: RingBuffer::new(ROLLING_WINDOW),
            tod_volume: [RollingStats::default(); 24],
            tod_depth: [RollingStats::default(); 24],
            prev_depth_1: None,
            prev_spread: None,
            last_metrics: None,
            last_seen_ms: 0,
        }
    }

    fn dispose(&mut self) {
        self.micro_prices.dispose();
        self.rolling_volume.dispose();
        self.rolling_depth.dispose();
        self.rolling_spread.dispose();
        self.rolling_imbalance.dispose();
    }

    fn buffered(&self) -> usize {
        self.micro_prices.len()
            + self.rolling_volume.len()
            + self.rolling_depth.len()
            + self.rolling_spread.len()
            + self.rolling_imbalance.len()
    }
}

fn rolling_z(history: &RingBuffer<f64>, value: f64) -> Option<f64> {
    if history.len() < MIN_ROLLING_SAMPLES {
        return None;
    }
    let values: Vec<f64> = history.iter().copied().collect();
    let (mean, sd) = mean_std(&values)?;
    if sd <= f64::EPSILON {
        return None;
    }
    Some((value - mean) / sd)
}

pub struct MicroUpdate {
    pub metrics: MicroMetrics,
    pub signals: Vec<EarlySignal>,
}

/// Enhanced microstructure analyzer (C5).
pub struct MicrostructureAnalyzer {
    config: SharedConfig,
    markets: HashMap<String, MarketMicroState>,
}

impl MicrostructureAnalyzer {
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
        self.markets.values().map(|m| m.buffered()).sum()
    }

    pub fn latest_metrics(&self, market_id: &str) -> Option<&MicroMetrics> {
        self.markets.get(market_id)?.last_metrics.as_ref()
    }

    pub fn analyze(&mut self, snapshot: &OrderbookSnapshot) -> MicroUpdate {
        let config = self.config.load();
        let state = self
            .markets
            .entry(snapshot.market_id.clone())
            .or_insert_with(MarketMicroState::new);

        state.last_seen_ms = snapshot.timestamp_ms;

        let bid_depth_1 = snapshot.bids.first().map(|l| l.size).unwrap_or(0.0);
        let ask_depth_1 = snapshot.asks.first().map(|l| l.size).unwrap_or(0.0);
        let total_depth_1 = bid_depth_1 + ask_depth_1;
        let imbalance = if total_depth_1 > 0.0 {
            (bid_depth_1 - ask_depth_1) / total_depth_1
        } else {
            0.0
        };
        let book_volume = snapshot.total_bid_volume() + snapshot.total_ask_volume();

        let micro_price = snapshot.micro_price();
        let (slope, drift) = match micro_price {
            Some(mp) => {
                state.micro_prices.push((snapshot.timestamp_ms, mp));
                let points: Vec<(f64, f64)> = state
                    .micro_prices
                    .iter()
                    .map(|(ts, p)| ((*ts as f64) / 1000.0, *p))
                    .collect();
                let slope = linreg_slope(&points);
                let drift = slope.and_then(|s| state.drift.update(s));
                (slope, drift)
            }
            None => (None, None),
        };

        let depth_change_pct = match state.prev_depth_1 {
            Some(prev) if prev > 0.0 => (total_depth_1 - prev) / prev * 100.0,
            _ => 0.0,
        };
        let spread_change_pct = match state.prev_spread {
            Some(prev) if prev > 0.0 => (snapshot.spread - prev) / prev * 100.0,
            Some(_) if snapshot.spread > 0.0 => 100.0,
            _ => 0.0,
        };

        let liquidity_vacuum = depth_change_pct < -config.microstructure.vacuum_depth_drop_pct
            && spread_change_pct.abs() < config.microstructure.vacuum_spread_stable_pct;

        // Score against history, then fold the observation in.
        let volume_z = rolling_z(&state.rolling_volume, book_volume);
        let depth_z = rolling_z(&state.rolling_depth, total_depth_1);
        let spread_z = rolling_z(&state.rolling_spread, snapshot.spread);
        let imbalance_z = rolling_z(&state.rolling_imbalance, imbalance);

        let hour_utc = Utc
            .timestamp_millis_opt(snapshot.timestamp_ms)
            .single()
            .map(|dt| dt.hour())
            .unwrap_or(0);
        let bucket = hour_utc as usize % 24;
        let tod_volume_z = state.tod_volume[bucket].z_score(book_volume);
        let tod_depth_z = state.tod_depth[bucket].z_score(total_depth_1);

        state.rolling_volume.push(book_volume);
        state.rolling_depth.push(total_depth_1);
        state.rolling_spread.push(snapshot.spread);
        state.rolling_imbalance.push(imbalance);
        state.tod_volume[bucket].update(book_volume);
        state.tod_depth[bucket].update(total_depth_1);
        state.prev_depth_1 = Some(total_depth_1);
        state.prev_spread = Some(snapshot.spread);

        let metrics = MicroMetrics {
            timestamp_ms: snapshot.timestamp_ms,
            hour_utc,
            bid_depth_1,
            ask_depth_1,
            total_depth_1,
            micro_price,
            micro_price_slope: slope,
            micro_price_drift: drift,
            imbalance,
            spread: snapshot.spread,
            spread_bps: spread_bps(snapshot.spread),
            spread_change_pct,
            depth_change_pct,
            book_volume,
            liquidity_vacuum,
            volume_z,
            depth_z,
            spread_z,
            imbalance_z,
            tod_volume_z,
            tod_depth_z,
        };

        let signals = micro_signals(&snapshot.market_id, &metrics, &config.microstructure);
        state.last_metrics = Some(metrics.clone());

        MicroUpdate { metrics, signals }
    }

    pub fn cleanup_stale_markets(&mut self, now_ms: i64) -> usize {
        let config = self.config.load();
        super::technical::cleanup_by_age_and_lru(
            &mut self.markets,
            now_ms,
            config.microstructure.max_age_ms,
            config.microstructure.max_markets,
            |state| state.last_seen_ms,
            |state| state.dispose(),
        )
    }

    pub fn aggressive_trim(&mut self, now_ms: i64, inactive_after_ms: i64, keep: usize) {
        for state in self.markets.values_mut() {
            if now_ms - state.last_seen_ms > inactive_after_ms {
                state.rolling_volume.trim_to_size(keep);
                state.rolling_depth.trim_to_size(keep);
                state.rolling_spread.trim_to_size(keep);
                state.rolling_imbalance.trim_to_size(keep);
            }
        }
    }

    pub fn dispose(&mut self) {
        for state in self.markets.values_mut() {
            state.dispose();
        }
        self.markets.clear();
    }
}

fn micro_signals(
    market: &str,
    metrics: &MicroMetrics,
    config: &crate::config::MicrostructureConfig,
) -> Vec<EarlySignal> {
    let mut signals = Vec::new();
    let ts = metrics.timestamp_ms;

    if metrics.liquidity_vacuum {
        let severity = if metrics.depth_change_pct < -VACUUM_CRITICAL_DROP_PCT {
            Severity::Critical
        } else {
            Severity::High
        };
        signals.push(
            EarlySignal::new(
                market,
                SignalKind::LiquidityVacuum,
                ts,
                (metrics.depth_change_pct.abs() / config.vacuum_depth_drop_pct).min(0.95),
                severity,
                format!(
                    "depth collapsed {:.0}% with spread stable ({:+.1}%)",
                    metrics.depth_change_pct, metrics.spread_change_pct
                ),
            )
            .with_metadata(serde_json::json!({
                "depth_change_pct": metrics.depth_change_pct,
                "spread_change_pct": metrics.spread_change_pct,
                "total_depth_1": metrics.total_depth_1,
            })),
        );
    }

    if let Some(imbalance_z) = metrics.imbalance_z {
        if imbalance_z > config.stealth_imbalance_z
            && metrics.spread_change_pct.abs() < STEALTH_SPREAD_BAND_PCT
        {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::StealthAccumulation,
                    ts,
                    confidence_from_z(imbalance_z),
                    if imbalance_z > config.stealth_imbalance_z * 1.5 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    format!(
                        "imbalance {imbalance_z:.1} sigma above baseline with quiet spread"
                    ),
                )
                .with_metadata(serde_json::json!({
                    "imbalance": metrics.imbalance,
                    "imbalance_z": imbalance_z,
                    "spread_change_pct": metrics.spread_change_pct,
                })),
            );
        }
    }

    if let Some(drift) = metrics.micro_price_drift {
        if drift > config.drift_threshold {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::MicroPriceDrift,
                    ts,
                    (drift / config.drift_high_severity).clamp(0.5, 0.9),
                    if drift > config.drift_high_severity {
                        Severity::High
                    } else {
                        Severity::Low
                    },
                    format!("micro-price drifting {drift:+.6}/s"),
                )
                .with_metadata(serde_json::json!({
                    "micro_price": metrics.micro_price,
                    "slope": metrics.micro_price_slope,
                    "drift": drift,
                })),
            );
        }
    }

    let off_hours = metrics.hour_utc >= 22 || metrics.hour_utc <= 6;
    if off_hours {
        let volume_burst = metrics
            .tod_volume_z
            .or(metrics.volume_z)
            .filter(|z| *z > config.off_hours_z);
        let depth_burst = metrics
            .tod_depth_z
            .or(metrics.depth_z)
            .filter(|z| *z > config.off_hours_z);
        if let Some(z) = volume_burst.into_iter().chain(depth_burst).reduce(f64::max) {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::OffHoursAnomaly,
                    ts,
                    confidence_from_z(z),
                    if z > config.off_hours_z * 1.5 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    format!(
                        "activity {z:.1} sigma above the {:02}:00 UTC baseline",
                        metrics.hour_utc
                    ),
                )
                .with_metadata(serde_json::json!({
                    "hour_utc": metrics.hour_utc,
                    "volume_z": metrics.tod_volume_z,
                    "depth_z": metrics.tod_depth_z,
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

    fn analyzer() -> MicrostructureAnalyzer {
        MicrostructureAnalyzer::new(SharedConfig::new(EngineConfig::default()))
    }

    fn book(ts: i64, bid: f64, ask: f64, bid_size: f64, ask_size: f64) -> OrderbookSnapshot {
        OrderbookSnapshot::new(
            ts,
            "mkt",
            vec![BookLevel::new(bid, bid_size)],
            vec![BookLevel::new(ask, ask_size)],
        )
    }

    /// Midnight UTC base keeps these tests inside the off-hours window only
    /// when they mean to be.
    const NOON: i64 = 1_700_000_000_000 - (1_700_000_000_000 % 86_400_000) + 12 * 3_600_000;

    #[test]
    fn vacuum_flags_on_depth_collapse_with_stable_spread() {
        let mut analyzer = analyzer();
        analyzer.analyze(&book(NOON, 0.48, 0.52, 500.0, 500.0));
        let update = analyzer.analyze(&book(NOON + 1000, 0.48, 0.52, 100.0, 100.0));

        assert!(update.metrics.liquidity_vacuum);
        assert!(update.metrics.depth_change_pct < -60.0);
        let vacuum = update
            .signals
            .iter()
            .find(|s| s.kind == SignalKind::LiquidityVacuum)
            .expect("vacuum signal");
        assert_eq!(vacuum.severity, Severity::Critical);
    }

    #[test]
    fn no_vacuum_when_spread_blows_out() {
        let mut analyzer = analyzer();
        analyzer.analyze(&book(NOON, 0.48, 0.52, 500.0, 500.0));
        // Depth collapses but the spread doubles with it: that is a repricing,
        // not a vacuum.
        let update = analyzer.analyze(&book(NOON + 1000, 0.46, 0.54, 100.0, 100.0));
        assert!(!update.metrics.liquidity_vacuum);
    }

    #[test]
    fn stealth_accumulation_needs_quiet_spread() {
        let mut analyzer = analyzer();
        // Long near-balanced baseline with a little natural noise.
        for i in 0..40 {
            let jitter = (i % 5) as f64;
            analyzer.analyze(&book(
                NOON + i * 1000,
                0.48,
                0.52,
                100.0 + jitter,
                100.0 - jitter,
            ));
        }
        // Heavy bid stacking, spread unchanged.
        let update = analyzer.analyze(&book(NOON + 41_000, 0.48, 0.52, 900.0, 100.0));

        assert!(
            update
                .signals
                .iter()
                .any(|s| s.kind == SignalKind::StealthAccumulation),
            "expected stealth accumulation, got {:?}",
            update.signals
        );
    }

    #[test]
    fn drift_tracks_trending_micro_price() {
        let mut analyzer = analyzer();
        let mut last = None;
        for i in 0..30 {
            // Ask size shrinking relative to bid pushes micro-price upward.
            let update = analyzer.analyze(&book(
                NOON + i * 1000,
                0.48 + i as f64 * 0.001,
                0.52 + i as f64 * 0.001,
                100.0,
                100.0,
            ));
            last = Some(update);
        }
        let update = last.unwrap();
        let drift = update.metrics.micro_price_drift.expect("drift available");
        assert!(drift > 0.0, "expected positive drift, got {drift}");
        assert!(update
            .signals
            .iter()
            .any(|s| s.kind == SignalKind::MicroPriceDrift));
    }

    #[test]
    fn off_hours_anomaly_requires_off_hours() {
        let mut base_day = analyzer();
        // Build a daytime baseline then burst at the same hour: no off-hours signal.
        for i in 0..40 {
            let jitter = (i % 7) as f64;
            base_day.analyze(&book(NOON + i * 1000, 0.48, 0.52, 100.0 + jitter, 100.0 + jitter));
        }
        let update = base_day.analyze(&book(NOON + 41_000, 0.48, 0.52, 5000.0, 5000.0));
        assert!(!update
            .signals
            .iter()
            .any(|s| s.kind == SignalKind::OffHoursAnomaly));

        // Same shape at 03:00 UTC fires.
        let night = NOON - 9 * 3_600_000; // 03:00 UTC
        let mut analyzer = analyzer();
        for i in 0..40 {
            let jitter = (i % 7) as f64;
            analyzer.analyze(&book(night + i * 1000, 0.48, 0.52, 100.0 + jitter, 100.0 + jitter));
        }
        let update = analyzer.analyze(&book(night + 41_000, 0.48, 0.52, 5000.0, 5000.0));
        assert!(
            update
                .signals
                .iter()
                .any(|s| s.kind == SignalKind::OffHoursAnomaly),
            "expected off-hours anomaly, got {:?}",
            update.signals
        );
    }

    #[test]
    fn z_scores_need_history() {
        let mut analyzer = analyzer();
        let update = analyzer.analyze(&book(NOON, 0.48, 0.52, 100.0, 100.0));
        assert!(update.metrics.volume_z.is_none());
        assert!(update.metrics.imbalance_z.is_none());
    }
}
