//! Coarse catalog-scan detection.
//!
//! Works on periodic catalog snapshots rather than the tick stream, so every
//! change here is *incremental between scans*. Volume comparisons use the
//! change since the previous scan, never the raw cumulative 24h number: two
//! cumulative figures an interval apart differ by construction, and comparing
//! them directly is how volume detectors end up firing on every market.
//!
//! Price changes are reported in probability points (price * 100). A 0.05
//! move is the same event at 0.10 as it is at 0.90; relative percent would
//! call the first a 50% move and the second a 5.6% move.

use std::collections::HashMap;

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::buffers::RingBuffer;
use crate::config::SharedConfig;
use crate::models::{CatalogMarket, EarlySignal, Severity, SignalKind};
use crate::stats::{confidence_from_z, mean_std, percentile_rank, severity_for};

/// Scans of volume-change history consulted for the spike baseline.
const RECENT_CHANGES: usize = 12;
/// Minimum prior changes before the spike detector trusts its baseline.
const MIN_RECENT_CHANGES: usize = 3;
/// Activity observations for the percentile detector.
const ACTIVITY_WINDOW: usize = 100;
/// Below this many observations the percentile detector falls back to
/// fixed thresholds.
const MIN_ACTIVITY_OBS: usize = 10;
/// Percentile that counts as unusual.
const UNUSUAL_PERCENTILE: f64 = 0.95;
/// Fixed-threshold fallback for young markets.
const FALLBACK_ACTIVITY_SCORE: f64 = 50.0;
/// Window in which a market counts as newly created.
const NEW_MARKET_WINDOW_MS: i64 = 3600 * 1000;

#[derive(Debug, Clone, Serialize)]
struct HistoryPoint {
    timestamp_ms: i64,
    volume_24h: f64,
    /// Change vs the previous scan, percent. None on the first sighting.
    volume_change_pct: Option<f64>,
    /// Per-outcome change vs the previous scan, probability points.
    price_changes_pp: Vec<f64>,
    activity_score: f64,
}

struct MarketHistory {
    points: RingBuffer<HistoryPoint>,
    activity: RingBuffer<f64>,
    last_prices: Vec<f64>,
    last_update_ms: i64,
}

impl MarketHistory {
    fn new(history_points: usize) -> Self {
        Self {
            points: RingBuffer::new(history_points),
            activity: RingBuffer::new(ACTIVITY_WINDOW),
            last_prices: Vec::new(),
            last_update_ms: 0,
        }
    }
}

/// Catalog-snapshot signal detector (C8).
pub struct SignalDetector {
    config: SharedConfig,
    histories: HashMap<String, MarketHistory>,
}

impl SignalDetector {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            histories: HashMap::new(),
        }
    }

    pub fn market_count(&self) -> usize {
        self.histories.len()
    }

    pub fn has_history(&self, market_id: &str) -> bool {
        self.histories.contains_key(market_id)
    }

    pub fn buffered_points(&self) -> usize {
        self.histories
            .values()
            .map(|h| h.points.len() + h.activity.len())
            .sum()
    }

    /// Scan one catalog snapshot, updating history and emitting raw signals.
    /// Dedup and confidence filtering happen downstream.
    pub fn scan(&mut self, catalog: &[CatalogMarket], now_ms: i64) -> Vec<EarlySignal> {
        let config = self.config.load();
        let mut signals = Vec::new();

        for market in catalog {
            if !market.active || market.closed {
                continue;
            }
            if market.volume_24h < config.min_volume_threshold {
                continue;
            }

            self.ensure_capacity(config.as_ref(), &market.id);
            let history = self
                .histories
                .entry(market.id.clone())
                .or_insert_with(|| MarketHistory::new(config.signals.history_points));

            let prev = history.points.latest();
            let volume_change_pct = prev.and_then(|p| {
                (p.volume_24h > 0.0)
                    .then(|| (market.volume_24h - p.volume_24h) / p.volume_24h * 100.0)
            });
            let price_changes_pp: Vec<f64> = market
                .outcome_prices
                .iter()
                .zip(history.last_prices.iter())
                .map(|(now, before)| (now - before) * 100.0)
                .collect();

            let sum_abs_pp: f64 = price_changes_pp.iter().map(|c| c.abs()).sum();
            let activity_score = volume_change_pct.map(|c| c.abs()).unwrap_or(0.0) + sum_abs_pp * 10.0;

            // Detectors run against history as it stood before this scan.
            if let Some(signal) = detect_new_market(market, now_ms, &config) {
                signals.push(signal);
            }
            if let Some(signal) = detect_volume_spike(market, volume_change_pct, history, &config, now_ms) {
                signals.push(signal);
            }
            if let Some(signal) =
                detect_price_movement(market, &price_changes_pp, history, &config, now_ms)
            {
                signals.push(signal);
            }
            if let Some(signal) = detect_unusual_activity(market, activity_score, history, now_ms) {
                signals.push(signal);
            }

            history.points.push(HistoryPoint {
                timestamp_ms: now_ms,
                volume_24h: market.volume_24h,
                volume_change_pct,
                price_changes_pp,
                activity_score,
            });
            history.activity.push(activity_score);
            history.last_prices = market.outcome_prices.clone();
            history.last_update_ms = now_ms;
        }

        signals
    }

    /// LRU bound on tracked histories.
    fn ensure_capacity(&mut self, config: &crate::config::EngineConfig, incoming: &str) {
        if self.histories.contains_key(incoming)
            || self.histories.len() < config.signals.history_markets
        {
            return;
        }
        let Some(oldest) = self
            .histories
            .iter()
            .min_by_key(|(_, h)| h.last_update_ms)
            .map(|(id, _)| id.clone())
        else {
            return;
        };
        if let Some(mut history) = self.histories.remove(&oldest) {
            history.points.dispose();
            history.activity.dispose();
        }
        debug!(market = %oldest, "catalog history evicted (LRU)");
    }

    pub fn cleanup_stale_markets(&mut self, now_ms: i64) -> usize {
        let config = self.config.load();
        let stale: Vec<String> = self
            .histories
            .iter()
            .filter(|(_, h)| now_ms - h.last_update_ms > config.microstructure.max_age_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(mut history) = self.histories.remove(id) {
                history.points.dispose();
                history.activity.dispose();
            }
        }
        stale.len()
    }

    pub fn dispose(&mut self) {
        for history in self.histories.values_mut() {
            history.points.dispose();
            history.activity.dispose();
        }
        self.histories.clear();
    }
}

fn detect_new_market(
    market: &CatalogMarket,
    now_ms: i64,
    config: &crate::config::EngineConfig,
) -> Option<EarlySignal> {
    let created_ms = market.created_at?.timestamp_millis();
    if now_ms - created_ms > NEW_MARKET_WINDOW_MS || now_ms < created_ms {
        return None;
    }
    let volume_floor = 2.0 * config.min_volume_threshold;
    if market.volume_24h <= volume_floor {
        return None;
    }

    let volume_multiple = market.volume_24h / volume_floor;
    Some(
        EarlySignal::new(
            &market.id,
            SignalKind::NewMarket,
            now_ms,
            (0.6 + volume_multiple * 0.05).min(0.9),
            if volume_multiple > 5.0 {
                Severity::High
            } else {
                Severity::Medium
            },
            format!(
                "new market already at ${:.0} volume: {}",
                market.volume_24h, market.question
            ),
        )
        .with_metadata(serde_json::json!({
            "volume_24h": market.volume_24h,
            "created_at_ms": created_ms,
            "question": market.question,
        })),
    )
}

fn detect_volume_spike(
    market: &CatalogMarket,
    volume_change_pct: Option<f64>,
    history: &MarketHistory,
    config: &crate::config::EngineConfig,
    now_ms: i64,
) -> Option<EarlySignal> {
    let current = volume_change_pct?;
    if current <= 0.0 || current <= config.signals.volume_spike_min_change_pct {
        return None;
    }

    // Baseline over the magnitudes of recent incremental changes.
    let recent: Vec<f64> = history
        .points
        .iter()
        .rev()
        .take(RECENT_CHANGES)
        .filter_map(|p| p.volume_change_pct)
        .map(|c| c.abs())
        .collect();
    if recent.len() < MIN_RECENT_CHANGES {
        return None;
    }

    let (avg_change, sd) = mean_std(&recent)?;
    if current <= avg_change * config.signals.volume_spike_multiplier {
        return None;
    }

    let confidence = if sd > f64::EPSILON {
        confidence_from_z((current - avg_change) / sd)
    } else {
        0.8
    };
    Some(
        EarlySignal::new(
            &market.id,
            SignalKind::VolumeSpike,
            now_ms,
            confidence,
            severity_for(current, avg_change * config.signals.volume_spike_multiplier),
            format!(
                "volume accelerating: +{current:.1}% this scan vs {avg_change:.1}% average"
            ),
        )
        .with_metadata(serde_json::json!({
            "volume_change_pct": current,
            "avg_recent_change_pct": avg_change,
            "multiplier": config.signals.volume_spike_multiplier,
            "volume_24h": market.volume_24h,
        })),
    )
}

fn detect_price_movement(
    market: &CatalogMarket,
    price_changes_pp: &[f64],
    history: &MarketHistory,
    config: &crate::config::EngineConfig,
    now_ms: i64,
) -> Option<EarlySignal> {
    if price_changes_pp.is_empty() {
        return None;
    }
    let immediate = price_changes_pp
        .iter()
        .map(|c| c.abs())
        .fold(0.0_f64, f64::max);

    // Two-interval cumulative change per outcome: this scan plus the last.
    let cumulative = history
        .points
        .latest()
        .map(|prev| {
            price_changes_pp
                .iter()
                .enumerate()
                .map(|(i, c)| (c + prev.price_changes_pp.get(i).copied().unwrap_or(0.0)).abs())
                .fold(0.0_f64, f64::max)
        })
        .unwrap_or(0.0);

    let magnitude = immediate.max(cumulative);
    if magnitude <= config.signals.price_movement_threshold_pp {
        return None;
    }
    let movement_type = if immediate >= cumulative { "sudden" } else { "trending" };

    // Confidence from the market's own movement distribution when we have
    // one, ratio-scaled otherwise.
    let past_moves: Vec<f64> = history
        .points
        .iter()
        .map(|p| {
            p.price_changes_pp
                .iter()
                .map(|c| c.abs())
                .fold(0.0_f64, f64::max)
        })
        .collect();
    let confidence = match mean_std(&past_moves) {
        Some((mean, sd)) if past_moves.len() >= MIN_ACTIVITY_OBS && sd > f64::EPSILON => {
            confidence_from_z((magnitude - mean) / sd)
        }
        _ => (0.5 + magnitude / config.signals.price_movement_threshold_pp * 0.15).min(0.9),
    };

    Some(
        EarlySignal::new(
            &market.id,
            SignalKind::PriceMovement,
            now_ms,
            confidence,
            severity_for(magnitude, config.signals.price_movement_threshold_pp),
            format!("{movement_type} move of {magnitude:.1} probability points"),
        )
        .with_metadata(serde_json::json!({
            "movement_type": movement_type,
            "magnitude_pp": magnitude,
            "immediate_pp": immediate,
            "cumulative_pp": cumulative,
            "price_changes_pp": price_changes_pp,
        })),
    )
}

fn detect_unusual_activity(
    market: &CatalogMarket,
    activity_score: f64,
    history: &MarketHistory,
    now_ms: i64,
) -> Option<EarlySignal> {
    let observations: Vec<f64> = history.activity.iter().copied().collect();

    let (confidence, percentile) = if observations.len() >= MIN_ACTIVITY_OBS {
        let percentile = percentile_rank(&observations, activity_score);
        if percentile < UNUSUAL_PERCENTILE {
            return None;
        }
        // Translate the percentile into sigma via the standard normal, then
        // onto the calibrated confidence ladder.
        let normal = Normal::new(0.0, 1.0).ok()?;
        let z = normal.inverse_cdf(percentile.min(0.9999));
        (confidence_from_z(z), Some(percentile))
    } else {
        if activity_score < FALLBACK_ACTIVITY_SCORE {
            return None;
        }
        (0.6, None)
    };

    Some(
        EarlySignal::new(
            &market.id,
            SignalKind::UnusualActivity,
            now_ms,
            confidence,
            if percentile.is_some_and(|p| p >= 0.99) {
                Severity::High
            } else {
                Severity::Medium
            },
            format!("activity score {activity_score:.0} is an outlier for this market"),
        )
        .with_metadata(serde_json::json!({
            "activity_score": activity_score,
            "percentile": percentile,
            "observations": observations.len(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use chrono::{TimeZone, Utc};

    fn detector() -> SignalDetector {
        SignalDetector::new(SharedConfig::new(EngineConfig::default()))
    }

    fn market(id: &str, volume: f64, prices: &[f64]) -> CatalogMarket {
        CatalogMarket {
            id: id.to_string(),
            question: format!("Will {id} resolve yes?"),
            outcomes: vec!["Yes".into(), "No".into()],
            outcome_prices: prices.to_vec(),
            volume_24h: volume,
            active: true,
            closed: false,
            created_at: None,
            end_date: None,
            tags: Vec::new(),
        }
    }

    const T0: i64 = 1_700_000_000_000;
    const SCAN_MS: i64 = 60_000;

    /// Drive repeated scans where volume grows by `changes[i]` percent each
    /// step, returning the signals of the final scan.
    fn run_volume_series(detector: &mut SignalDetector, changes: &[f64]) -> Vec<EarlySignal> {
        let mut volume = 10_000.0;
        let mut last = Vec::new();
        detector.scan(&[market("m", volume, &[0.5, 0.5])], T0);
        for (i, pct) in changes.iter().enumerate() {
            volume *= 1.0 + pct / 100.0;
            last = detector.scan(
                &[market("m", volume, &[0.5, 0.5])],
                T0 + (i as i64 + 1) * SCAN_MS,
            );
        }
        last
    }

    #[test]
    fn volume_spike_compares_incremental_changes() {
        // ~5% background drift, then a 20% jump: spike.
        let mut detector1 = detector();
        let signals = run_volume_series(&mut detector1, &[5.0, 5.0, 5.0, 5.0, 5.0, 20.0]);
        assert!(
            signals.iter().any(|s| s.kind == SignalKind::VolumeSpike),
            "expected a volume spike, got {signals:?}"
        );

        // Same background, 10% jump: 10 < 5 * 2.5, no spike.
        let mut detector2 = detector();
        let signals = run_volume_series(&mut detector2, &[5.0, 5.0, 5.0, 5.0, 5.0, 10.0]);
        assert!(!signals.iter().any(|s| s.kind == SignalKind::VolumeSpike));
    }

    #[test]
    fn cumulative_volume_never_triggers_by_itself() {
        // Large cumulative volume with zero incremental change must not fire.
        let mut detector = detector();
        let signals = run_volume_series(&mut detector, &[0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(!signals.iter().any(|s| s.kind == SignalKind::VolumeSpike));
    }

    #[test]
    fn price_movement_reports_probability_points() {
        // The same 5pp move at low, mid and high probability levels.
        for (before, after) in [(0.10, 0.15), (0.50, 0.55), (0.90, 0.95)] {
            let mut detector = detector();
            detector.scan(&[market("m", 10_000.0, &[before, 1.0 - before])], T0);
            let signals = detector.scan(&[market("m", 10_000.0, &[after, 1.0 - after])], T0 + SCAN_MS);

            // 5pp is at the threshold, not above it: nudge with one more step.
            let signals = if signals.is_empty() {
                detector.scan(
                    &[market("m", 10_000.0, &[after + 0.02, 1.0 - after - 0.02])],
                    T0 + 2 * SCAN_MS,
                )
            } else {
                signals
            };

            let movement = signals
                .iter()
                .find(|s| s.kind == SignalKind::PriceMovement)
                .unwrap_or_else(|| panic!("no movement for {before} -> {after}"));
            let magnitude = movement.metadata["magnitude_pp"].as_f64().unwrap();
            // Absolute points, identical across price levels.
            assert!((magnitude - 7.0).abs() < 1e-6, "got {magnitude}");
        }
    }

    #[test]
    fn sudden_vs_trending_classification() {
        let mut detector1 = detector();
        detector1.scan(&[market("m", 10_000.0, &[0.50, 0.50])], T0);
        // One large jump: sudden.
        let signals = detector1.scan(&[market("m", 10_000.0, &[0.58, 0.42])], T0 + SCAN_MS);
        let movement = signals
            .iter()
            .find(|s| s.kind == SignalKind::PriceMovement)
            .expect("movement signal");
        assert_eq!(movement.metadata["movement_type"], "sudden");

        // Two 3.5pp steps in the same direction: cumulative 7pp, trending.
        let mut detector2 = detector();
        detector2.scan(&[market("m", 10_000.0, &[0.50, 0.50])], T0);
        detector2.scan(&[market("m", 10_000.0, &[0.535, 0.465])], T0 + SCAN_MS);
        let signals = detector2.scan(&[market("m", 10_000.0, &[0.57, 0.43])], T0 + 2 * SCAN_MS);
        let movement = signals
            .iter()
            .find(|s| s.kind == SignalKind::PriceMovement)
            .expect("movement signal");
        assert_eq!(movement.metadata["movement_type"], "trending");
    }

    #[test]
    fn new_market_requires_recency_and_volume() {
        let mut detector = detector();
        let mut fresh = market("fresh", 5_000.0, &[0.5, 0.5]);
        fresh.created_at = Some(Utc.timestamp_millis_opt(T0 - 30 * 60_000).unwrap());
        let mut old = market("old", 5_000.0, &[0.5, 0.5]);
        old.created_at = Some(Utc.timestamp_millis_opt(T0 - 5 * 3600 * 1000).unwrap());
        let mut quiet = market("quiet", 1_500.0, &[0.5, 0.5]);
        quiet.created_at = Some(Utc.timestamp_millis_opt(T0 - 30 * 60_000).unwrap());

        let signals = detector.scan(&[fresh, old, quiet], T0);
        let new_markets: Vec<_> = signals
            .iter()
            .filter(|s| s.kind == SignalKind::NewMarket)
            .collect();
        assert_eq!(new_markets.len(), 1);
        assert_eq!(new_markets[0].market_id, "fresh");
    }

    #[test]
    fn unusual_activity_uses_percentiles_after_warmup() {
        let mut detector = detector();
        // Calm history: tiny price wiggles.
        let mut price = 0.50;
        for i in 0..20 {
            price += if i % 2 == 0 { 0.001 } else { -0.001 };
            detector.scan(
                &[market("m", 10_000.0, &[price, 1.0 - price])],
                T0 + i * SCAN_MS,
            );
        }
        // A 4pp lurch is far outside that distribution even though it is
        // below the absolute price-movement threshold.
        let signals = detector.scan(
            &[market("m", 10_000.0, &[price + 0.04, 1.0 - price - 0.04])],
            T0 + 21 * SCAN_MS,
        );
        assert!(
            signals.iter().any(|s| s.kind == SignalKind::UnusualActivity),
            "expected unusual activity, got {signals:?}"
        );
    }

    #[test]
    fn lru_eviction_bounds_tracked_markets() {
        let mut detector = detector();
        // 201 markets with distinct scan times; the cap is 200.
        for i in 0..201 {
            detector.scan(
                &[market(&format!("market-{i}"), 10_000.0, &[0.5, 0.5])],
                T0 + i * SCAN_MS,
            );
        }
        assert_eq!(detector.market_count(), 200);
        assert!(!detector.has_history("market-0"));
        assert!(detector.has_history("market-200"));
    }

    #[test]
    fn ignores_inactive_and_thin_markets() {
        let mut detector = detector();
        let mut closed = market("closed", 50_000.0, &[0.5, 0.5]);
        closed.closed = true;
        let thin = market("thin", 10.0, &[0.5, 0.5]);

        detector.scan(&[closed, thin], T0);
        assert_eq!(detector.market_count(), 0);
    }
}
