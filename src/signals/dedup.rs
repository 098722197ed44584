//! Signal emission gate: per-kind cooldowns, a confidence floor, and a
//! rolling-statistics outlier filter.
//!
//! The cooldown table enforces the at-most-once guarantee per
//! (market, kind, window). The outlier stage keeps one corrupt feed frame
//! from producing a 50-sigma "signal": extreme magnitudes are dropped unless
//! a second detector corroborates the same market in the same batch.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::config::{DedupConfig, SharedConfig};
use crate::models::{EarlySignal, SignalKind};
use crate::stats::RollingStats;

const MIN_SAMPLE_SIZE: u64 = 30;
const OUTLIER_SIGMA: f64 = 4.0;

fn cooldown_for(kind: SignalKind, config: &DedupConfig) -> i64 {
    match kind {
        SignalKind::NewMarket => config.new_market_ms,
        SignalKind::VolumeSpike => config.volume_spike_ms,
        SignalKind::PriceMovement => config.price_movement_ms,
        SignalKind::UnusualActivity => config.unusual_activity_ms,
        SignalKind::CoordinatedCrossMarket => config.cross_market_ms,
        _ => config.microstructure_ms,
    }
}

/// Magnitude worth tracking per family, pulled from signal metadata.
fn metric_for_signal(signal: &EarlySignal) -> Option<(&'static str, f64)> {
    let get = |key: &str| signal.metadata.get(key).and_then(|v| v.as_f64());
    match signal.kind {
        SignalKind::VolumeSpike => Some(("volume_spike_pct", get("volume_change_pct")?)),
        SignalKind::PriceMovement => Some(("price_movement_pp", get("magnitude_pp")?)),
        SignalKind::UnusualActivity => Some(("activity_score", get("activity_score")?)),
        SignalKind::OrderbookImbalance => Some(("imbalance_deviation", get("deviation")?)),
        SignalKind::SpreadAnomaly => Some(("spread_sigma", get("z_score")?)),
        SignalKind::StealthAccumulation => Some(("stealth_sigma", get("imbalance_z")?)),
        _ => None,
    }
}

/// Per-(market, kind) cooldown tracker.
pub struct SignalDedup {
    last_emitted: HashMap<(String, SignalKind), i64>,
}

impl SignalDedup {
    pub fn new() -> Self {
        Self {
            last_emitted: HashMap::new(),
        }
    }

    /// True when the signal may be emitted now; records the emission.
    pub fn accept(&mut self, signal: &EarlySignal, now_ms: i64, config: &DedupConfig) -> bool {
        let key = (signal.market_id.clone(), signal.kind);
        let cooldown = cooldown_for(signal.kind, config);
        if let Some(last) = self.last_emitted.get(&key) {
            if now_ms - last <= cooldown {
                debug!(
                    market = %signal.market_id,
                    kind = signal.kind.as_str(),
                    remaining_ms = cooldown - (now_ms - last),
                    "signal suppressed by cooldown"
                );
                return false;
            }
        }
        self.last_emitted.insert(key, now_ms);
        true
    }

    /// Drop bookkeeping entries whose cooldown has long passed.
    pub fn prune(&mut self, now_ms: i64, config: &DedupConfig) {
        let horizon = [
            config.new_market_ms,
            config.volume_spike_ms,
            config.price_movement_ms,
            config.unusual_activity_ms,
            config.cross_market_ms,
            config.microstructure_ms,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        self.last_emitted.retain(|_, last| now_ms - *last <= horizon * 2);
    }

    pub fn len(&self) -> usize {
        self.last_emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_emitted.is_empty()
    }
}

impl Default for SignalDedup {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling per-family statistics; flags magnitudes beyond `OUTLIER_SIGMA`.
struct QualityStats {
    stats: HashMap<&'static str, RollingStats>,
}

impl QualityStats {
    fn new() -> Self {
        Self {
            stats: HashMap::new(),
        }
    }

    /// Whether the signal survives the outlier check. `corroborated` means a
    /// second detector flagged the same market in this batch.
    fn admit(&mut self, signal: &EarlySignal, corroborated: bool) -> bool {
        let Some((family, value)) = metric_for_signal(signal) else {
            return true;
        };

        let stats = self.stats.entry(family).or_default();
        let mut keep = true;
        if stats.count >= MIN_SAMPLE_SIZE {
            let sd = stats.std_dev();
            if sd > 0.0 && value > stats.mean() + OUTLIER_SIGMA * sd && !corroborated {
                warn!(
                    market = %signal.market_id,
                    family,
                    observed = value,
                    mean = stats.mean(),
                    std = sd,
                    "🛑 dropping >{OUTLIER_SIGMA:.0}σ outlier without corroboration"
                );
                keep = false;
            }
        }
        if keep {
            stats.update(value);
        }
        keep
    }
}

/// Full emission gate: confidence floor, then outlier filter, then cooldown.
pub struct SignalGate {
    config: SharedConfig,
    dedup: SignalDedup,
    quality: QualityStats,
}

impl SignalGate {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            dedup: SignalDedup::new(),
            quality: QualityStats::new(),
        }
    }

    /// Filter a batch, preserving order of the survivors.
    pub fn admit_batch(&mut self, signals: Vec<EarlySignal>, now_ms: i64) -> Vec<EarlySignal> {
        if signals.is_empty() {
            return signals;
        }
        let config = self.config.load();

        // Corroboration map: markets flagged by more than one kind.
        let mut kinds_per_market: HashMap<&str, HashSet<SignalKind>> = HashMap::new();
        for signal in &signals {
            kinds_per_market
                .entry(signal.market_id.as_str())
                .or_default()
                .insert(signal.kind);
        }
        let corroborated: HashSet<String> = kinds_per_market
            .iter()
            .filter(|(_, kinds)| kinds.len() >= 2)
            .map(|(market, _)| market.to_string())
            .collect();

        let mut accepted = Vec::with_capacity(signals.len());
        for signal in signals {
            if signal.confidence < config.alerts.min_confidence {
                debug!(
                    market = %signal.market_id,
                    kind = signal.kind.as_str(),
                    confidence = signal.confidence,
                    "signal below confidence floor"
                );
                continue;
            }
            if !self
                .quality
                .admit(&signal, corroborated.contains(&signal.market_id))
            {
                continue;
            }
            if !self.dedup.accept(&signal, now_ms, &config.dedup) {
                continue;
            }
            accepted.push(signal);
        }
        accepted
    }

    /// Single-signal convenience for the per-frame path.
    pub fn admit(&mut self, signal: EarlySignal, now_ms: i64) -> Option<EarlySignal> {
        self.admit_batch(vec![signal], now_ms).pop()
    }

    pub fn prune(&mut self, now_ms: i64) {
        let config = self.config.load();
        self.dedup.prune(now_ms, &config.dedup);
    }

    pub fn tracked_entries(&self) -> usize {
        self.dedup.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::Severity;

    fn gate() -> SignalGate {
        SignalGate::new(SharedConfig::new(EngineConfig::default()))
    }

    fn signal(market: &str, kind: SignalKind, ts: i64, confidence: f64) -> EarlySignal {
        EarlySignal::new(market, kind, ts, confidence, Severity::Medium, "test")
    }

    #[test]
    fn cooldown_suppresses_within_window() {
        let mut gate = gate();
        let cooldown = EngineConfig::default().dedup.volume_spike_ms;

        let t0 = 1_000_000;
        assert!(gate
            .admit(signal("m", SignalKind::VolumeSpike, t0, 0.9), t0)
            .is_some());
        // Inside (t, t + cooldown]: suppressed, including the boundary.
        assert!(gate
            .admit(signal("m", SignalKind::VolumeSpike, t0 + 1, 0.9), t0 + 1)
            .is_none());
        assert!(gate
            .admit(
                signal("m", SignalKind::VolumeSpike, t0 + cooldown, 0.9),
                t0 + cooldown
            )
            .is_none());
        // Strictly past the window: allowed again.
        assert!(gate
            .admit(
                signal("m", SignalKind::VolumeSpike, t0 + cooldown + 1, 0.9),
                t0 + cooldown + 1
            )
            .is_some());
    }

    #[test]
    fn cooldowns_are_per_market_and_kind() {
        let mut gate = gate();
        let t0 = 1_000_000;
        assert!(gate
            .admit(signal("a", SignalKind::VolumeSpike, t0, 0.9), t0)
            .is_some());
        // Different market, same kind: independent window.
        assert!(gate
            .admit(signal("b", SignalKind::VolumeSpike, t0 + 1, 0.9), t0 + 1)
            .is_some());
        // Same market, different kind: independent window.
        assert!(gate
            .admit(signal("a", SignalKind::PriceMovement, t0 + 2, 0.9), t0 + 2)
            .is_some());
    }

    #[test]
    fn confidence_floor_applies() {
        let mut gate = gate();
        assert!(gate
            .admit(signal("m", SignalKind::VolumeSpike, 0, 0.4), 0)
            .is_none());
        assert!(gate
            .admit(signal("m", SignalKind::VolumeSpike, 0, 0.5), 0)
            .is_some());
    }

    #[test]
    fn outliers_need_corroboration() {
        let mut gate = gate();
        // Build up family statistics with unremarkable spikes.
        for i in 0..40 {
            let s = signal("warmup", SignalKind::VolumeSpike, i * 10_000_000, 0.9).with_metadata(
                serde_json::json!({"volume_change_pct": 20.0 + (i % 5) as f64}),
            );
            gate.admit(s, i * 10_000_000);
        }

        let t = 500_000_000;
        let wild = signal("m", SignalKind::VolumeSpike, t, 0.95)
            .with_metadata(serde_json::json!({"volume_change_pct": 100_000.0}));
        assert!(gate.admit(wild.clone(), t).is_none());

        // Same outlier, but another detector also flags the market in the
        // same batch: corroborated, kept.
        let movement = signal("m", SignalKind::PriceMovement, t, 0.9)
            .with_metadata(serde_json::json!({"magnitude_pp": 8.0}));
        let admitted = gate.admit_batch(vec![wild, movement], t + 1);
        assert_eq!(admitted.len(), 2);
    }

    #[test]
    fn prune_bounds_bookkeeping() {
        let mut gate = gate();
        for i in 0..100 {
            gate.admit(
                signal(&format!("m{i}"), SignalKind::PriceMovement, 0, 0.9),
                0,
            );
        }
        assert_eq!(gate.tracked_entries(), 100);
        gate.prune(10 * 24 * 3600 * 1000);
        assert_eq!(gate.tracked_entries(), 0);
    }
}
