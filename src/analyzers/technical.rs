//! Streaming technical indicators per market.
//!
//! All estimators are incremental: RSI keeps Wilder-smoothed averages, the
//! MACD signal line is an EMA over the MACD stream itself, and nothing ever
//! recomputes over the full window or consumes a sample that hasn't arrived
//! yet. Truncating the tick stream at time t and replaying reproduces the
//! exact values the engine reported at t.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::buffers::TickBuffer;
use crate::config::SharedConfig;
use crate::models::{EarlySignal, SignalKind, Tick};
use crate::stats::{severity_for, EmaState};

/// Ticks required before indicators are considered meaningful.
const MIN_TICKS: usize = 50;
/// Lookback for the momentum estimate, in ticks.
const MOMENTUM_LOOKBACK: usize = 10;
/// VWAP window for price-deviation checks.
const VWAP_WINDOW_MS: i64 = 5 * 60 * 1000;
/// Histogram magnitude that qualifies a MACD crossover.
const MACD_HISTOGRAM_FLOOR: f64 = 0.001;

/// Wilder-smoothed RSI. Seeded with the SMA of the first `period` deltas,
/// then `avg += (current - avg) / period`.
#[derive(Debug, Clone)]
struct RsiState {
    period: usize,
    prev_price: Option<f64>,
    seed_gain: f64,
    seed_loss: f64,
    deltas: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl RsiState {
    fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_price: None,
            seed_gain: 0.0,
            seed_loss: 0.0,
            deltas: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    fn update(&mut self, price: f64) -> Option<f64> {
        let prev = match self.prev_price.replace(price) {
            Some(p) => p,
            None => return None,
        };
        let delta = price - prev;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        self.deltas += 1;
        if self.deltas <= self.period {
            self.seed_gain += gain;
            self.seed_loss += loss;
            if self.deltas == self.period {
                self.avg_gain = self.seed_gain / self.period as f64;
                self.avg_loss = self.seed_loss / self.period as f64;
                return Some(self.value());
            }
            return None;
        }

        let period = self.period as f64;
        self.avg_gain += (gain - self.avg_gain) / period;
        self.avg_loss += (loss - self.avg_loss) / period;
        Some(self.value())
    }

    fn value(&self) -> f64 {
        if self.avg_loss <= 0.0 {
            // No losses in the window: saturated if there were gains,
            // neutral on a flat series.
            return if self.avg_gain > 0.0 { 100.0 } else { 50.0 };
        }
        let rs = self.avg_gain / self.avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MacdSample {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD = EMA12 - EMA26; signal = 9-period EMA of the MACD line, seeded
/// incrementally from the first 9 MACD samples.
#[derive(Debug, Clone)]
struct MacdState {
    fast: EmaState,
    slow: EmaState,
    signal: EmaState,
}

impl MacdState {
    fn new() -> Self {
        Self {
            fast: EmaState::new(12),
            slow: EmaState::new(26),
            signal: EmaState::new(9),
        }
    }

    fn update(&mut self, price: f64) -> Option<MacdSample> {
        let fast = self.fast.update(price);
        let slow = self.slow.update(price);
        let line = fast? - slow?;
        let signal = self.signal.update(line)?;
        Some(MacdSample {
            line,
            signal,
            histogram: line - signal,
        })
    }
}

/// Indicator snapshot used for signal context and orchestrator enrichment.
#[derive(Debug, Clone, Serialize)]
pub struct TechnicalSnapshot {
    pub timestamp_ms: i64,
    pub tick_count: usize,
    pub rsi: Option<f64>,
    pub macd: Option<MacdSample>,
    pub momentum_pct: Option<f64>,
    pub vwap: Option<f64>,
    pub price_deviation_pct: Option<f64>,
}

struct MarketTechState {
    ticks: TickBuffer,
    rsi: RsiState,
    macd: MacdState,
    prev_macd: Option<MacdSample>,
    last_snapshot: Option<TechnicalSnapshot>,
    last_seen_ms: i64,
}

impl MarketTechState {
    fn new(tick_buffer_size: usize) -> Self {
        Self {
            ticks: TickBuffer::new(tick_buffer_size),
            rsi: RsiState::new(14),
            macd: MacdState::new(),
            prev_macd: None,
            last_snapshot: None,
            last_seen_ms: 0,
        }
    }
}

pub struct TechUpdate {
    pub snapshot: Option<TechnicalSnapshot>,
    pub signals: Vec<EarlySignal>,
}

/// Per-market streaming indicator engine (C3).
pub struct TechnicalIndicators {
    config: SharedConfig,
    markets: HashMap<String, MarketTechState>,
}

impl TechnicalIndicators {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            markets: HashMap::new(),
        }
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    /// Total buffered ticks, for the memory-ceiling check.
    pub fn buffered_points(&self) -> usize {
        self.markets.values().map(|m| m.ticks.len()).sum()
    }

    pub fn latest_snapshot(&self, market_id: &str) -> Option<&TechnicalSnapshot> {
        self.markets.get(market_id)?.last_snapshot.as_ref()
    }

    /// Feed one tick; returns the updated snapshot and any indicator signals.
    pub fn on_tick(&mut self, tick: &Tick) -> TechUpdate {
        let config = self.config.load();
        let state = self
            .markets
            .entry(tick.market_id.clone())
            .or_insert_with(|| MarketTechState::new(config.microstructure.tick_buffer_size));

        state.last_seen_ms = tick.timestamp_ms;
        let rsi = state.rsi.update(tick.price);
        let macd = state.macd.update(tick.price);
        state.ticks.push(tick.clone());

        if state.ticks.len() < MIN_TICKS {
            let prev = state.prev_macd;
            state.prev_macd = macd.or(prev);
            return TechUpdate {
                snapshot: None,
                signals: Vec::new(),
            };
        }

        let momentum = state.ticks.momentum(MOMENTUM_LOOKBACK);
        let vwap = state.ticks.vwap(VWAP_WINDOW_MS);
        let deviation = match vwap {
            Some(v) if v > 0.0 => Some((tick.price - v) / v * 100.0),
            _ => None,
        };

        let snapshot = TechnicalSnapshot {
            timestamp_ms: tick.timestamp_ms,
            tick_count: state.ticks.len(),
            rsi,
            macd,
            momentum_pct: momentum,
            vwap,
            price_deviation_pct: deviation,
        };

        let signals = indicator_signals(
            tick,
            &snapshot,
            state.prev_macd.as_ref(),
            config.microstructure.momentum_threshold_pct,
            config.microstructure.vwap_deviation_pct,
        );

        state.prev_macd = macd.or(state.prev_macd);
        state.last_snapshot = Some(snapshot.clone());

        TechUpdate {
            snapshot: Some(snapshot),
            signals,
        }
    }

    /// Evict markets beyond `max_age` or over the market cap (LRU).
    pub fn cleanup_stale_markets(&mut self, now_ms: i64) -> usize {
        let config = self.config.load();
        cleanup_by_age_and_lru(
            &mut self.markets,
            now_ms,
            config.microstructure.max_age_ms,
            config.microstructure.max_markets,
            |state| state.last_seen_ms,
            |state| state.ticks.dispose(),
        )
    }

    /// Memory-pressure trim: inactive markets keep only their newest points.
    pub fn aggressive_trim(&mut self, now_ms: i64, inactive_after_ms: i64, keep: usize) {
        for state in self.markets.values_mut() {
            if now_ms - state.last_seen_ms > inactive_after_ms {
                state.ticks.trim_to_size(keep);
            }
        }
    }

    pub fn dispose(&mut self) {
        for state in self.markets.values_mut() {
            state.ticks.dispose();
        }
        self.markets.clear();
    }
}

/// Shared age + LRU eviction used by every per-market analyzer.
pub(crate) fn cleanup_by_age_and_lru<S>(
    markets: &mut HashMap<String, S>,
    now_ms: i64,
    max_age_ms: i64,
    max_markets: usize,
    last_seen: impl Fn(&S) -> i64,
    mut release: impl FnMut(&mut S),
) -> usize {
    let stale: Vec<String> = markets
        .iter()
        .filter(|(_, s)| now_ms - last_seen(*s) > max_age_ms)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &stale {
        if let Some(mut state) = markets.remove(id) {
            release(&mut state);
        }
    }
    let mut evicted = stale.len();

    while markets.len() > max_markets {
        let Some(oldest) = markets
            .iter()
            .min_by_key(|(_, s)| last_seen(*s))
            .map(|(id, _)| id.clone())
        else {
            break;
        };
        if let Some(mut state) = markets.remove(&oldest) {
            release(&mut state);
        }
        debug!(market = %oldest, "evicted least-recently-updated market");
        evicted += 1;
    }
    evicted
}

fn indicator_signals(
    tick: &Tick,
    snapshot: &TechnicalSnapshot,
    prev_macd: Option<&MacdSample>,
    momentum_threshold: f64,
    vwap_threshold: f64,
) -> Vec<EarlySignal> {
    let mut signals = Vec::new();
    let market = tick.market_id.as_str();
    let ts = tick.timestamp_ms;

    if let (Some(rsi), Some(momentum)) = (snapshot.rsi, snapshot.momentum_pct) {
        if rsi < 30.0 && momentum > 2.0 {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::MomentumBreakout,
                    ts,
                    (momentum.abs() / momentum_threshold).min(0.95),
                    severity_for(momentum, momentum_threshold),
                    format!("oversold bounce: RSI {rsi:.1} with +{momentum:.2}% momentum"),
                )
                .with_metadata(serde_json::json!({
                    "trigger": "rsi_oversold_bounce",
                    "rsi": rsi,
                    "momentum_pct": momentum,
                })),
            );
        } else if rsi > 70.0 && momentum < -2.0 {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::MomentumBreakout,
                    ts,
                    (momentum.abs() / momentum_threshold).min(0.95),
                    severity_for(momentum, momentum_threshold),
                    format!("overbought drop: RSI {rsi:.1} with {momentum:.2}% momentum"),
                )
                .with_metadata(serde_json::json!({
                    "trigger": "rsi_overbought_drop",
                    "rsi": rsi,
                    "momentum_pct": momentum,
                })),
            );
        }
    }

    if let (Some(macd), Some(prev)) = (snapshot.macd, prev_macd) {
        let crossed_up = prev.line <= prev.signal && macd.line > macd.signal;
        if crossed_up && macd.histogram.abs() > MACD_HISTOGRAM_FLOOR {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::MomentumBreakout,
                    ts,
                    (macd.histogram.abs() / MACD_HISTOGRAM_FLOOR).min(0.95),
                    severity_for(macd.histogram, MACD_HISTOGRAM_FLOOR),
                    format!("MACD bullish crossover, histogram {:.4}", macd.histogram),
                )
                .with_metadata(serde_json::json!({
                    "trigger": "macd_bullish_crossover",
                    "macd_line": macd.line,
                    "macd_signal": macd.signal,
                    "macd_histogram": macd.histogram,
                })),
            );
        }
    }

    if let Some(momentum) = snapshot.momentum_pct {
        if momentum.abs() > momentum_threshold {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::MomentumBreakout,
                    ts,
                    (momentum.abs() / momentum_threshold).min(0.95),
                    severity_for(momentum, momentum_threshold),
                    format!("momentum breakout: {momentum:.2}% over {MOMENTUM_LOOKBACK} ticks"),
                )
                .with_metadata(serde_json::json!({
                    "trigger": "momentum_breakout",
                    "momentum_pct": momentum,
                })),
            );
        }
    }

    if let (Some(deviation), Some(vwap)) = (snapshot.price_deviation_pct, snapshot.vwap) {
        if deviation.abs() > vwap_threshold {
            signals.push(
                EarlySignal::new(
                    market,
                    SignalKind::MomentumBreakout,
                    ts,
                    (deviation.abs() / vwap_threshold).min(0.95),
                    severity_for(deviation, vwap_threshold),
                    format!("price {deviation:.2}% away from VWAP {vwap:.4}"),
                )
                .with_metadata(serde_json::json!({
                    "trigger": "vwap_deviation",
                    "vwap": vwap,
                    "deviation_pct": deviation,
                })),
            );
        }
    }

    signals
}
