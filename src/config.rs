//! Engine configuration.
//!
//! Sourced from environment variables (the file-based loader lives with the
//! deployment tooling, not here). Validation is fatal at startup and
//! non-fatal on reload: a bad reload keeps the previous config and logs.
//!
//! Analyzers hold a [`SharedConfig`] and call `load()` once per frame, so a
//! swapped config takes effect on the next frame without locking.

use std::sync::Arc;

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn env_f64(var: &str, default: f64) -> f64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Thresholds for the per-frame microstructure analyzers (C3-C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrostructureConfig {
    /// Deviation of bid/ask ratio from its 5-minute baseline.
    pub orderbook_imbalance_threshold: f64,
    /// Spread z-score against rolling spread volatility.
    pub spread_anomaly_threshold: f64,
    /// Absolute change of the liquidity score vs baseline.
    pub liquidity_shift_threshold: f64,
    pub tick_buffer_size: usize,
    pub book_buffer_size: usize,
    /// Momentum breakout trigger, percent.
    pub momentum_threshold_pct: f64,
    /// VWAP deviation trigger, percent.
    pub vwap_deviation_pct: f64,
    /// Depth drop that qualifies as a vacuum, percent. Tunable; no derived value.
    pub vacuum_depth_drop_pct: f64,
    /// Spread stability band for the vacuum flag, percent. Tunable.
    pub vacuum_spread_stable_pct: f64,
    /// Imbalance z-score for stealth accumulation.
    pub stealth_imbalance_z: f64,
    /// Minimum micro-price drift to report. Tunable; source constant, no derivation.
    pub drift_threshold: f64,
    /// Drift above this is high severity. Tunable.
    pub drift_high_severity: f64,
    /// Volume/depth z-score for off-hours anomalies.
    pub off_hours_z: f64,
    /// Per-market state older than this is evicted.
    pub max_age_ms: i64,
    /// Per-analyzer cap on tracked markets; LRU beyond this.
    pub max_markets: usize,
}

impl Default for MicrostructureConfig {
    fn default() -> Self {
        Self {
            orderbook_imbalance_threshold: 0.3,
            spread_anomaly_threshold: 2.0,
            liquidity_shift_threshold: 20.0,
            tick_buffer_size: 1000,
            book_buffer_size: 1000,
            momentum_threshold_pct: 5.0,
            vwap_deviation_pct: 2.0,
            vacuum_depth_drop_pct: 40.0,
            vacuum_spread_stable_pct: 15.0,
            stealth_imbalance_z: 3.0,
            drift_threshold: 0.0,
            drift_high_severity: 1e-3,
            off_hours_z: 3.0,
            max_age_ms: 24 * 3600 * 1000,
            max_markets: 500,
        }
    }
}

/// Thresholds for the coarse catalog-scan detectors (C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Incremental volume change must exceed avg recent change times this.
    pub volume_spike_multiplier: f64,
    /// ... and exceed this floor, percent.
    pub volume_spike_min_change_pct: f64,
    /// Price movement trigger in probability points (price * 100).
    pub price_movement_threshold_pp: f64,
    pub cross_market_correlation_threshold: f64,
    /// Bounded history per market (points).
    pub history_points: usize,
    /// LRU cap on markets with history.
    pub history_markets: usize,
    /// Down-sampling floor between stored price points.
    pub min_update_interval_ms: i64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            volume_spike_multiplier: 2.5,
            volume_spike_min_change_pct: 15.0,
            price_movement_threshold_pp: 5.0,
            cross_market_correlation_threshold: 0.7,
            history_points: 2880,
            history_markets: 200,
            min_update_interval_ms: 30_000,
        }
    }
}

/// Emission gates applied before anything reaches the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Signals below this confidence are dropped.
    pub min_confidence: f64,
    /// Front-running score required to emit a leak signal.
    pub front_running_score: f64,
    /// Front-running confidence required to emit a leak signal.
    pub front_running_confidence: f64,
    /// Base of the heuristic time-to-news estimate, minutes. Calibration is
    /// an open question upstream; treat as tunable.
    pub time_to_news_base_min: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            front_running_score: 0.65,
            front_running_confidence: 0.6,
            time_to_news_base_min: 30.0,
        }
    }
}

/// Per-kind emission cooldowns, milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub new_market_ms: i64,
    pub volume_spike_ms: i64,
    pub price_movement_ms: i64,
    pub unusual_activity_ms: i64,
    pub cross_market_ms: i64,
    /// Default for every microstructure kind.
    pub microstructure_ms: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            new_market_ms: 60 * 60 * 1000,
            volume_spike_ms: 10 * 60 * 1000,
            price_movement_ms: 5 * 60 * 1000,
            unusual_activity_ms: 15 * 60 * 1000,
            cross_market_ms: 30 * 60 * 1000,
            microstructure_ms: 5 * 60 * 1000,
        }
    }
}

/// WebSocket ingestor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub ws_url: String,
    pub max_frame_bytes: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            max_frame_bytes: 50 * 1024,
            reconnect_base_ms: 1000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Catalog scan period.
    pub check_interval_ms: u64,
    /// Markets below this 24h volume are ignored by the catalog scan.
    pub min_volume_threshold: f64,
    /// Cap on markets the orchestrator will track at once.
    pub max_markets_to_track: usize,
    /// Housekeeping timer period.
    pub housekeeping_interval_ms: u64,
    /// Total buffered points across analyzers before aggressive cleanup.
    pub memory_ceiling_points: usize,
    /// Consecutive catalog failures before the breaker opens.
    pub catalog_breaker_failures: u32,
    /// Cooldown before the open catalog breaker lets a probe through.
    pub catalog_breaker_cooldown_ms: i64,
    pub microstructure: MicrostructureConfig,
    pub signals: SignalConfig,
    pub alerts: AlertThresholds,
    pub dedup: DedupConfig,
    pub ingest: IngestConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            min_volume_threshold: 1000.0,
            max_markets_to_track: 500,
            housekeeping_interval_ms: 5 * 60 * 1000,
            memory_ceiling_points: 2_000_000,
            catalog_breaker_failures: 5,
            catalog_breaker_cooldown_ms: 5 * 60 * 1000,
            microstructure: MicrostructureConfig::default(),
            signals: SignalConfig::default(),
            alerts: AlertThresholds::default(),
            dedup: DedupConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            check_interval_ms: env_u64("CHECK_INTERVAL_MS", defaults.check_interval_ms),
            min_volume_threshold: env_f64("MIN_VOLUME_THRESHOLD", defaults.min_volume_threshold),
            max_markets_to_track: env_usize("MAX_MARKETS_TO_TRACK", defaults.max_markets_to_track),
            housekeeping_interval_ms: env_u64(
                "HOUSEKEEPING_INTERVAL_MS",
                defaults.housekeeping_interval_ms,
            ),
            memory_ceiling_points: env_usize("MEMORY_CEILING_POINTS", defaults.memory_ceiling_points),
            catalog_breaker_failures: env_u64(
                "CATALOG_BREAKER_FAILURE_THRESHOLD",
                defaults.catalog_breaker_failures as u64,
            ) as u32,
            catalog_breaker_cooldown_ms: env_u64(
                "CATALOG_BREAKER_COOLDOWN_MS",
                defaults.catalog_breaker_cooldown_ms as u64,
            ) as i64,
            microstructure: MicrostructureConfig {
                orderbook_imbalance_threshold: env_f64(
                    "ORDERBOOK_IMBALANCE_THRESHOLD",
                    defaults.microstructure.orderbook_imbalance_threshold,
                ),
                spread_anomaly_threshold: env_f64(
                    "SPREAD_ANOMALY_THRESHOLD",
                    defaults.microstructure.spread_anomaly_threshold,
                ),
                liquidity_shift_threshold: env_f64(
                    "LIQUIDITY_SHIFT_THRESHOLD",
                    defaults.microstructure.liquidity_shift_threshold,
                ),
                tick_buffer_size: env_usize(
                    "TICK_BUFFER_SIZE",
                    defaults.microstructure.tick_buffer_size,
                ),
                book_buffer_size: env_usize(
                    "BOOK_BUFFER_SIZE",
                    defaults.microstructure.book_buffer_size,
                ),
                momentum_threshold_pct: env_f64(
                    "MOMENTUM_THRESHOLD_PCT",
                    defaults.microstructure.momentum_threshold_pct,
                ),
                vwap_deviation_pct: env_f64(
                    "VWAP_DEVIATION_PCT",
                    defaults.microstructure.vwap_deviation_pct,
                ),
                vacuum_depth_drop_pct: env_f64(
                    "VACUUM_DEPTH_DROP_PCT",
                    defaults.microstructure.vacuum_depth_drop_pct,
                ),
                vacuum_spread_stable_pct: env_f64(
                    "VACUUM_SPREAD_STABLE_PCT",
                    defaults.microstructure.vacuum_spread_stable_pct,
                ),
                stealth_imbalance_z: env_f64(
                    "STEALTH_IMBALANCE_Z",
                    defaults.microstructure.stealth_imbalance_z,
                ),
                drift_threshold: env_f64("DRIFT_THRESHOLD", defaults.microstructure.drift_threshold),
                drift_high_severity: env_f64(
                    "DRIFT_HIGH_SEVERITY",
                    defaults.microstructure.drift_high_severity,
                ),
                off_hours_z: env_f64("OFF_HOURS_Z", defaults.microstructure.off_hours_z),
                max_age_ms: env_u64("MARKET_MAX_AGE_MS", defaults.microstructure.max_age_ms as u64)
                    as i64,
                max_markets: env_usize("ANALYZER_MAX_MARKETS", defaults.microstructure.max_markets),
            },
            signals: SignalConfig {
                volume_spike_multiplier: env_f64(
                    "VOLUME_SPIKE_MULTIPLIER",
                    defaults.signals.volume_spike_multiplier,
                ),
                volume_spike_min_change_pct: env_f64(
                    "VOLUME_SPIKE_MIN_CHANGE_PCT",
                    defaults.signals.volume_spike_min_change_pct,
                ),
                price_movement_threshold_pp: env_f64(
                    "PRICE_MOVEMENT_THRESHOLD_PP",
                    defaults.signals.price_movement_threshold_pp,
                ),
                cross_market_correlation_threshold: env_f64(
                    "CROSS_MARKET_CORRELATION_THRESHOLD",
                    defaults.signals.cross_market_correlation_threshold,
                ),
                history_points: env_usize("HISTORY_POINTS", defaults.signals.history_points),
                history_markets: env_usize("HISTORY_MARKETS", defaults.signals.history_markets),
                min_update_interval_ms: env_u64(
                    "MIN_UPDATE_INTERVAL_MS",
                    defaults.signals.min_update_interval_ms as u64,
                ) as i64,
            },
            alerts: AlertThresholds {
                min_confidence: env_f64("MIN_SIGNAL_CONFIDENCE", defaults.alerts.min_confidence),
                front_running_score: env_f64(
                    "FRONT_RUNNING_SCORE",
                    defaults.alerts.front_running_score,
                ),
                front_running_confidence: env_f64(
                    "FRONT_RUNNING_CONFIDENCE",
                    defaults.alerts.front_running_confidence,
                ),
                time_to_news_base_min: env_f64(
                    "TIME_TO_NEWS_BASE_MIN",
                    defaults.alerts.time_to_news_base_min,
                ),
            },
            dedup: DedupConfig {
                new_market_ms: env_u64("DEDUP_NEW_MARKET_MS", defaults.dedup.new_market_ms as u64)
                    as i64,
                volume_spike_ms: env_u64(
                    "DEDUP_VOLUME_SPIKE_MS",
                    defaults.dedup.volume_spike_ms as u64,
                ) as i64,
                price_movement_ms: env_u64(
                    "DEDUP_PRICE_MOVEMENT_MS",
                    defaults.dedup.price_movement_ms as u64,
                ) as i64,
                unusual_activity_ms: env_u64(
                    "DEDUP_UNUSUAL_ACTIVITY_MS",
                    defaults.dedup.unusual_activity_ms as u64,
                ) as i64,
                cross_market_ms: env_u64(
                    "DEDUP_CROSS_MARKET_MS",
                    defaults.dedup.cross_market_ms as u64,
                ) as i64,
                microstructure_ms: env_u64(
                    "DEDUP_MICROSTRUCTURE_MS",
                    defaults.dedup.microstructure_ms as u64,
                ) as i64,
            },
            ingest: IngestConfig {
                ws_url: env_string("STREAM_WS_URL", &defaults.ingest.ws_url),
                max_frame_bytes: env_usize("MAX_FRAME_BYTES", defaults.ingest.max_frame_bytes),
                reconnect_base_ms: env_u64("RECONNECT_BASE_MS", defaults.ingest.reconnect_base_ms),
                reconnect_cap_ms: env_u64("RECONNECT_CAP_MS", defaults.ingest.reconnect_cap_ms),
                max_reconnect_attempts: env_u64(
                    "MAX_RECONNECT_ATTEMPTS",
                    defaults.ingest.max_reconnect_attempts as u64,
                ) as u32,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would silently disable the engine.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_ms == 0 {
            bail!("check_interval_ms must be > 0");
        }
        if self.max_markets_to_track == 0 {
            bail!("max_markets_to_track must be > 0");
        }
        if self.microstructure.tick_buffer_size == 0 || self.microstructure.book_buffer_size == 0 {
            bail!("buffer sizes must be > 0");
        }
        if !(0.0..=1.0).contains(&self.alerts.min_confidence) {
            bail!(
                "min_confidence must be in [0, 1], got {}",
                self.alerts.min_confidence
            );
        }
        if self.signals.volume_spike_multiplier <= 1.0 {
            bail!("volume_spike_multiplier must be > 1.0");
        }
        if !(0.0..=1.0).contains(&self.signals.cross_market_correlation_threshold) {
            bail!("cross_market_correlation_threshold must be in [0, 1]");
        }
        if self.ingest.max_frame_bytes == 0 {
            bail!("max_frame_bytes must be > 0");
        }
        if self.catalog_breaker_failures == 0 {
            bail!("catalog_breaker_failures must be > 0");
        }
        Ok(())
    }
}

/// Process-wide, hot-swappable config handle. `load()` is a wait-free read.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<EngineConfig>>,
}

impl SharedConfig {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn load(&self) -> Arc<EngineConfig> {
        self.inner.load_full()
    }

    /// Replace the active config. Invalid input keeps the old one.
    pub fn reload(&self, candidate: EngineConfig) -> Result<()> {
        match candidate.validate() {
            Ok(()) => {
                self.inner.store(Arc::new(candidate));
                info!("✅ configuration reloaded");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "invalid config on reload; keeping previous");
                Err(e)
            }
        }
    }

    /// Re-read the environment and swap if valid.
    pub fn reload_from_env(&self) -> Result<()> {
        self.reload(EngineConfig::from_env()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_interval() {
        let config = EngineConfig {
            check_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut config = EngineConfig::default();
        config.alerts.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_breaker_threshold() {
        let config = EngineConfig {
            catalog_breaker_failures: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn reload_keeps_old_on_invalid() {
        let shared = SharedConfig::new(EngineConfig::default());
        let before = shared.load().check_interval_ms;

        let bad = EngineConfig {
            check_interval_ms: 0,
            ..Default::default()
        };
        assert!(shared.reload(bad).is_err());
        assert_eq!(shared.load().check_interval_ms, before);
    }

    #[test]
    fn reload_swaps_valid_config() {
        let shared = SharedConfig::new(EngineConfig::default());
        let updated = EngineConfig {
            check_interval_ms: 5_000,
            ..Default::default()
        };
        shared.reload(updated).unwrap();
        assert_eq!(shared.load().check_interval_ms, 5_000);
    }
}
