//! Cross-market coordination detection.
//!
//! Catalog scans feed one down-sampled price/volume series per market; the
//! periodic correlation pass runs Pearson over every candidate pair on the
//! rayon pool (the one CPU-bound batch in the system) and caches the peers
//! it finds so the per-frame front-running path can read them without
//! recomputing anything.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::buffers::PriceBuffer;
use crate::config::SharedConfig;
use crate::models::{CatalogMarket, EarlySignal, PricePoint, Severity, SignalKind};

/// Correlation window over the down-sampled series.
const CORRELATION_WINDOW_MS: i64 = 6 * 3600 * 1000;
/// Minimum stored points per market before it joins the pair scan.
const MIN_SERIES_POINTS: usize = 6;
/// Without tags, only the most recently active markets pair up.
const UNTAGGED_PAIR_LIMIT: usize = 30;

#[derive(Debug, Clone, Serialize)]
pub struct CorrelatedPeer {
    pub market_id: String,
    pub price_correlation: f64,
    pub volume_correlation: Option<f64>,
}

struct MarketSeries {
    points: PriceBuffer,
    tags: Vec<String>,
    last_update_ms: i64,
}

/// Cross-market correlator (C8c).
pub struct CrossMarketCorrelator {
    config: SharedConfig,
    series: HashMap<String, MarketSeries>,
    /// Peers found by the last scan, keyed by market.
    peers: HashMap<String, Vec<CorrelatedPeer>>,
}

impl CrossMarketCorrelator {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            series: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    pub fn market_count(&self) -> usize {
        self.series.len()
    }

    pub fn buffered_points(&self) -> usize {
        self.series.values().map(|s| s.points.len()).sum()
    }

    /// Record one catalog observation for a market.
    pub fn record(&mut self, market: &CatalogMarket, now_ms: i64) {
        let config = self.config.load();
        let Some(price) = market.outcome_prices.first().copied() else {
            return;
        };
        let entry = self
            .series
            .entry(market.id.clone())
            .or_insert_with(|| MarketSeries {
                points: PriceBuffer::new(
                    config.signals.history_points,
                    config.signals.min_update_interval_ms,
                ),
                tags: market.tags.clone(),
                last_update_ms: 0,
            });
        entry.tags = market.tags.clone();
        entry.last_update_ms = now_ms;
        entry.points.record(PricePoint {
            timestamp_ms: now_ms,
            price,
            volume: market.volume_24h,
            spread: None,
        });
    }

    /// Cached peers for a market from the last scan. Used as the optional
    /// cross-market input of the front-running scorer.
    pub fn peers(&self, market_id: &str) -> Option<&[CorrelatedPeer]> {
        self.peers.get(market_id).map(|v| v.as_slice())
    }

    /// Run the pairwise Pearson batch and emit coordination signals.
    pub fn scan(&mut self, now_ms: i64) -> Vec<EarlySignal> {
        let config = self.config.load();
        let threshold = config.signals.cross_market_correlation_threshold;

        let candidates: Vec<(&String, &MarketSeries)> = self
            .series
            .iter()
            .filter(|(_, s)| s.points.len() >= MIN_SERIES_POINTS)
            .collect();
        let pairs = candidate_pairs(&candidates);
        if pairs.is_empty() {
            self.peers.clear();
            return Vec::new();
        }

        debug!(pairs = pairs.len(), "running cross-market correlation batch");
        let correlated: Vec<(String, String, f64, Option<f64>)> = pairs
            .par_iter()
            .filter_map(|(a, b)| {
                let sa = self.series.get(a)?;
                let sb = self.series.get(b)?;
                let price_r = sa.points.pearson_correlation(&sb.points, CORRELATION_WINDOW_MS)?;
                if price_r.abs() < threshold {
                    return None;
                }
                let volume_r =
                    sa.points
                        .pearson_with(&sb.points, CORRELATION_WINDOW_MS, |p| p.volume);
                Some(((*a).clone(), (*b).clone(), price_r, volume_r))
            })
            .collect();

        self.peers.clear();
        let mut signals = Vec::new();
        for (a, b, price_r, volume_r) in correlated {
            self.peers.entry(a.clone()).or_default().push(CorrelatedPeer {
                market_id: b.clone(),
                price_correlation: price_r,
                volume_correlation: volume_r,
            });
            self.peers.entry(b.clone()).or_default().push(CorrelatedPeer {
                market_id: a.clone(),
                price_correlation: price_r,
                volume_correlation: volume_r,
            });

            let direction = if price_r > 0.0 { "moving with" } else { "moving against" };
            signals.push(
                EarlySignal::new(
                    &a,
                    SignalKind::CoordinatedCrossMarket,
                    now_ms,
                    price_r.abs().min(0.95),
                    if price_r.abs() > 0.9 {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    format!("{a} {direction} {b} (r = {price_r:.2})"),
                )
                .with_metadata(serde_json::json!({
                    "peer_market": b,
                    "price_correlation": price_r,
                    "volume_correlation": volume_r,
                })),
            );
        }
        signals
    }

    pub fn cleanup_stale_markets(&mut self, now_ms: i64) -> usize {
        let config = self.config.load();
        let stale: Vec<String> = self
            .series
            .iter()
            .filter(|(_, s)| now_ms - s.last_update_ms > config.microstructure.max_age_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(mut series) = self.series.remove(id) {
                series.points.dispose();
            }
            self.peers.remove(id);
        }
        stale.len()
    }

    pub fn dispose(&mut self) {
        for series in self.series.values_mut() {
            series.points.dispose();
        }
        self.series.clear();
        self.peers.clear();
    }
}

/// Pair markets that share a topic tag; with no tags anywhere, fall back to
/// all pairs over the most recently active markets.
fn candidate_pairs(candidates: &[(&String, &MarketSeries)]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let tagged: Vec<(&str, &MarketSeries)> = candidates
        .iter()
        .filter(|(_, s)| !s.tags.is_empty())
        .map(|(id, s)| (id.as_str(), *s))
        .collect();

    if !tagged.is_empty() {
        let mut by_tag: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, series) in &tagged {
            for tag in &series.tags {
                by_tag.entry(tag.as_str()).or_default().push(id);
            }
        }
        let mut seen: std::collections::HashSet<(String, String)> =
            std::collections::HashSet::new();
        for members in by_tag.values() {
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    let (a, b) = if members[i] < members[j] {
                        (members[i].to_string(), members[j].to_string())
                    } else {
                        (members[j].to_string(), members[i].to_string())
                    };
                    if seen.insert((a.clone(), b.clone())) {
                        pairs.push((a, b));
                    }
                }
            }
        }
        return pairs;
    }

    let mut recent: Vec<(&str, i64)> = candidates
        .iter()
        .map(|(id, s)| (id.as_str(), s.last_update_ms))
        .collect();
    recent.sort_by_key(|(_, last)| std::cmp::Reverse(*last));
    recent.truncate(UNTAGGED_PAIR_LIMIT);
    for i in 0..recent.len() {
        for j in (i + 1)..recent.len() {
            pairs.push((recent[i].0.to_string(), recent[j].0.to_string()));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn correlator() -> CrossMarketCorrelator {
        let mut config = EngineConfig::default();
        // No down-sampling floor in tests; points arrive minute-spaced anyway.
        config.signals.min_update_interval_ms = 0;
        CrossMarketCorrelator::new(SharedConfig::new(config))
    }

    fn market(id: &str, price: f64, volume: f64, tags: &[&str]) -> CatalogMarket {
        CatalogMarket {
            id: id.to_string(),
            question: id.to_string(),
            outcomes: vec!["Yes".into(), "No".into()],
            outcome_prices: vec![price, 1.0 - price],
            volume_24h: volume,
            active: true,
            closed: false,
            created_at: None,
            end_date: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    const T0: i64 = 1_700_000_000_000;
    const STEP: i64 = 60_000;

    #[test]
    fn coordinated_markets_are_flagged() {
        let mut correlator = correlator();
        for i in 0..12 {
            let drift = i as f64 * 0.01;
            let now = T0 + i * STEP;
            correlator.record(&market("a", 0.30 + drift, 10_000.0 + i as f64 * 500.0, &["elections"]), now);
            correlator.record(&market("b", 0.40 + drift, 20_000.0 + i as f64 * 900.0, &["elections"]), now);
            correlator.record(&market("noise", 0.50 + (i as f64 * 1.7).sin() * 0.05, 15_000.0, &["sports"]), now);
        }

        let signals = correlator.scan(T0 + 13 * STEP);
        assert_eq!(signals.len(), 1, "got {signals:?}");
        assert_eq!(signals[0].kind, SignalKind::CoordinatedCrossMarket);

        // Both ends of the pair see each other as peers.
        let peers_a = correlator.peers("a").expect("peers for a");
        assert_eq!(peers_a[0].market_id, "b");
        assert!(peers_a[0].price_correlation > 0.99);
        assert!(correlator.peers("b").is_some());
        assert!(correlator.peers("noise").is_none());
    }

    #[test]
    fn tags_partition_the_pair_space() {
        let mut correlator = correlator();
        // Perfectly co-moving markets, but in different topic clusters.
        for i in 0..12 {
            let drift = i as f64 * 0.01;
            let now = T0 + i * STEP;
            correlator.record(&market("a", 0.30 + drift, 10_000.0, &["crypto"]), now);
            correlator.record(&market("b", 0.40 + drift, 10_000.0, &["weather"]), now);
        }
        assert!(correlator.scan(T0 + 13 * STEP).is_empty());
    }

    #[test]
    fn untagged_markets_still_pair_up() {
        let mut correlator = correlator();
        for i in 0..12 {
            let drift = i as f64 * 0.01;
            let now = T0 + i * STEP;
            correlator.record(&market("a", 0.30 + drift, 10_000.0, &[]), now);
            correlator.record(&market("b", 0.40 + drift, 10_000.0, &[]), now);
        }
        let signals = correlator.scan(T0 + 13 * STEP);
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn short_series_are_excluded() {
        let mut correlator = correlator();
        for i in 0..3 {
            let now = T0 + i * STEP;
            correlator.record(&market("a", 0.30, 10_000.0, &["x"]), now);
            correlator.record(&market("b", 0.40, 10_000.0, &["x"]), now);
        }
        assert!(correlator.scan(T0 + 4 * STEP).is_empty());
    }
}
