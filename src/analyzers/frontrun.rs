//! Information-leak scoring from microstructure pressure.
//!
//! Combines the enhanced-microstructure z-scores with optional cross-market
//! evidence from correlated markets in the same topic cluster. Cross-market
//! input is optional by contract: when absent that component contributes 0
//! and the score leans entirely on single-market pressure.

use std::collections::HashMap;

use serde::Serialize;

use crate::buffers::RingBuffer;
use crate::config::SharedConfig;
use crate::models::{EarlySignal, Severity, SignalKind};
use crate::stats::severity_for;

use super::microstructure::MicroMetrics;

/// Z-score that saturates a component at 1.
const Z_SATURATION: f64 = 4.0;
/// Assessments kept per market for the persistence term.
const SCORE_HISTORY: usize = 10;
const RECENT_SCORES: usize = 5;

/// Component weights. Tuned constants; calibration is configuration-level.
const W_IMBALANCE: f64 = 0.30;
const W_DRIFT: f64 = 0.20;
const W_VOLUME: f64 = 0.20;
const W_SPREAD: f64 = 0.10;
const W_CROSS: f64 = 0.20;

/// Evidence from a correlated market in the same topic cluster.
#[derive(Debug, Clone, Serialize)]
pub struct CrossMarketEvidence {
    pub market_id: String,
    pub correlation: f64,
    pub imbalance_z: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FrontRunComponents {
    pub imbalance: f64,
    pub drift: f64,
    pub volume: f64,
    pub spread: f64,
    pub cross_market: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrontRunAssessment {
    pub market_id: String,
    pub timestamp_ms: i64,
    /// Composite leak score in [0, 1].
    pub score: f64,
    /// How much of the score rests on populated inputs and a persistent
    /// pattern rather than a single frame.
    pub confidence: f64,
    pub leak_probability: f64,
    /// Heuristic estimate, minutes. Unit and base are configurable; the
    /// calibration is an open question upstream.
    pub time_to_news_min: f64,
    pub components: FrontRunComponents,
}

struct MarketScoreState {
    scores: RingBuffer<f64>,
    last_seen_ms: i64,
}

/// Front-running scorer (C7).
pub struct FrontRunScorer {
    config: SharedConfig,
    markets: HashMap<String, MarketScoreState>,
}

impl FrontRunScorer {
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
        self.markets.values().map(|m| m.scores.len()).sum()
    }

    /// Score the latest microstructure frame. Returns the assessment and,
    /// when it clears the configured thresholds, a leak signal.
    pub fn assess(
        &mut self,
        micro: &MicroMetrics,
        market_id: &str,
        cross_market: Option<&[CrossMarketEvidence]>,
    ) -> (FrontRunAssessment, Option<EarlySignal>) {
        let config = self.config.load();

        let saturate = |z: f64| (z.abs() / Z_SATURATION).min(1.0);

        let imbalance = micro.imbalance_z.map(saturate).unwrap_or(0.0);
        let drift = micro
            .micro_price_drift
            .map(|d| {
                (d.abs() / (2.0 * config.microstructure.drift_high_severity)).min(1.0)
            })
            .unwrap_or(0.0);
        let volume = micro
            .volume_z
            .into_iter()
            .chain(micro.tod_volume_z)
            .map(saturate)
            .fold(0.0, f64::max);
        let spread = micro.spread_z.map(saturate).unwrap_or(0.0);

        let cross = match cross_market {
            Some(evidence) if !evidence.is_empty() => {
                let sum: f64 = evidence
                    .iter()
                    .map(|e| {
                        let pressure = e.imbalance_z.map(saturate).unwrap_or(0.0);
                        e.correlation.abs().min(1.0) * pressure
                    })
                    .sum();
                (sum / evidence.len() as f64).min(1.0)
            }
            _ => 0.0,
        };

        let components = FrontRunComponents {
            imbalance,
            drift,
            volume,
            spread,
            cross_market: cross,
        };
        let score = W_IMBALANCE * imbalance
            + W_DRIFT * drift
            + W_VOLUME * volume
            + W_SPREAD * spread
            + W_CROSS * cross;

        // Availability: how many inputs actually carried data this frame.
        let mut available = 0.0;
        let mut total = 4.0;
        available += micro.imbalance_z.is_some() as u8 as f64;
        available += micro.micro_price_drift.is_some() as u8 as f64;
        available += (micro.volume_z.is_some() || micro.tod_volume_z.is_some()) as u8 as f64;
        available += micro.spread_z.is_some() as u8 as f64;
        if cross_market.is_some() {
            total += 1.0;
            available += 1.0;
        }
        let availability = available / total;

        let state = self
            .markets
            .entry(market_id.to_string())
            .or_insert_with(|| MarketScoreState {
                scores: RingBuffer::new(SCORE_HISTORY),
                last_seen_ms: 0,
            });
        state.last_seen_ms = micro.timestamp_ms;

        // Persistence: one hot frame is noise, a run of them is a pattern.
        let recent: Vec<f64> = state
            .scores
            .iter()
            .rev()
            .take(RECENT_SCORES)
            .copied()
            .collect();
        let persistence = if recent.is_empty() {
            0.0
        } else {
            (recent.iter().sum::<f64>() / recent.len() as f64 * 2.0).min(1.0)
        };
        state.scores.push(score);

        let confidence = (availability * 0.6 + persistence * 0.4).clamp(0.0, 1.0);
        let leak_probability = (score * confidence).clamp(0.0, 1.0);
        let time_to_news_min =
            (config.alerts.time_to_news_base_min * (1.0 - score)).max(1.0);

        let assessment = FrontRunAssessment {
            market_id: market_id.to_string(),
            timestamp_ms: micro.timestamp_ms,
            score,
            confidence,
            leak_probability,
            time_to_news_min,
            components,
        };

        let signal = if score > config.alerts.front_running_score
            && confidence > config.alerts.front_running_confidence
        {
            Some(leak_signal(&assessment))
        } else {
            None
        };

        (assessment, signal)
    }

    pub fn cleanup_stale_markets(&mut self, now_ms: i64) -> usize {
        let config = self.config.load();
        super::technical::cleanup_by_age_and_lru(
            &mut self.markets,
            now_ms,
            config.microstructure.max_age_ms,
            config.microstructure.max_markets,
            |state| state.last_seen_ms,
            |state| state.scores.dispose(),
        )
    }

    pub fn dispose(&mut self) {
        for state in self.markets.values_mut() {
            state.scores.dispose();
        }
        self.markets.clear();
    }
}

fn leak_signal(assessment: &FrontRunAssessment) -> EarlySignal {
    let severity = if assessment.score > 0.85 {
        Severity::Critical
    } else {
        severity_for(assessment.score, 0.5)
    };
    EarlySignal::new(
        &assessment.market_id,
        SignalKind::FrontRunningDetected,
        assessment.timestamp_ms,
        assessment.confidence,
        severity,
        format!(
            "informed-flow pattern: leak probability {:.0}%, est. {:.0}m to news",
            assessment.leak_probability * 100.0,
            assessment.time_to_news_min
        ),
    )
    .with_metadata(serde_json::json!({
        "leak_kind": SignalKind::InformationLeak.as_str(),
        "score": assessment.score,
        "leak_probability": assessment.leak_probability,
        "time_to_news_min": assessment.time_to_news_min,
        "components": assessment.components,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn scorer() -> FrontRunScorer {
        FrontRunScorer::new(SharedConfig::new(EngineConfig::default()))
    }

    fn hot_metrics(ts: i64) -> MicroMetrics {
        MicroMetrics {
            timestamp_ms: ts,
            hour_utc: 14,
            bid_depth_1: 900.0,
            ask_depth_1: 100.0,
            total_depth_1: 1000.0,
            micro_price: Some(0.51),
            micro_price_slope: Some(2e-3),
            micro_price_drift: Some(2e-3),
            imbalance: 0.8,
            spread: 0.02,
            spread_bps: 200.0,
            spread_change_pct: 1.0,
            depth_change_pct: 5.0,
            book_volume: 5000.0,
            liquidity_vacuum: false,
            volume_z: Some(4.5),
            depth_z: Some(1.0),
            spread_z: Some(3.0),
            imbalance_z: Some(4.2),
            tod_volume_z: Some(4.0),
            tod_depth_z: None,
        }
    }

    fn quiet_metrics(ts: i64) -> MicroMetrics {
        MicroMetrics {
            volume_z: Some(0.1),
            spread_z: Some(0.0),
            imbalance_z: Some(0.2),
            tod_volume_z: Some(0.1),
            micro_price_slope: Some(1e-6),
            micro_price_drift: Some(1e-6),
            imbalance: 0.02,
            ..hot_metrics(ts)
        }
    }

    #[test]
    fn quiet_market_scores_low() {
        let mut scorer = scorer();
        let (assessment, signal) = scorer.assess(&quiet_metrics(1000), "mkt", None);
        assert!(assessment.score < 0.2, "score {}", assessment.score);
        assert!(signal.is_none());
    }

    #[test]
    fn persistent_pressure_raises_confidence_and_emits() {
        let mut scorer = scorer();
        let mut emitted = None;
        for i in 0..6 {
            let (_, signal) = scorer.assess(&hot_metrics(i * 1000), "mkt", None);
            if signal.is_some() {
                emitted = signal;
            }
        }

        let signal = emitted.expect("persistent pressure should emit a leak signal");
        assert_eq!(signal.kind, SignalKind::FrontRunningDetected);
        assert_eq!(signal.metadata["leak_kind"], "information_leak");
    }

    #[test]
    fn missing_cross_market_contributes_zero() {
        let mut with = scorer();
        let mut without = scorer();

        let evidence = vec![CrossMarketEvidence {
            market_id: "peer".into(),
            correlation: 0.9,
            imbalance_z: Some(4.0),
        }];
        let (a, _) = with.assess(&hot_metrics(1000), "mkt", Some(&evidence));
        let (b, _) = without.assess(&hot_metrics(1000), "mkt", None);

        assert_eq!(b.components.cross_market, 0.0);
        assert!(a.components.cross_market > 0.8);
        assert!(a.score > b.score);
    }

    #[test]
    fn single_hot_frame_lacks_confidence() {
        let mut scorer = scorer();
        let (assessment, signal) = scorer.assess(&hot_metrics(1000), "mkt", None);
        // Score is high but persistence is empty: confidence stays shy of
        // the emission threshold on the first frame.
        assert!(assessment.score > 0.6);
        assert!(signal.is_none());
    }

    #[test]
    fn time_to_news_shrinks_with_score() {
        let mut scorer = scorer();
        let (hot, _) = scorer.assess(&hot_metrics(1000), "hot", None);
        let (quiet, _) = scorer.assess(&quiet_metrics(1000), "quiet", None);
        assert!(hot.time_to_news_min < quiet.time_to_news_min);
    }
}
