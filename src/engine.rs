//! Microstructure detection orchestrator.
//!
//! Owns every analyzer exclusively and runs the hot path single-writer per
//! market: one dispatch task consumes the ingestor's event channel, so no
//! per-market state is ever touched concurrently. Timers (housekeeping,
//! catalog scan) live on the same task via `select!`, which keeps analyzer
//! calls synchronous and frame-scoped.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::analyzers::frontrun::{CrossMarketEvidence, FrontRunScorer};
use crate::analyzers::microstructure::MicrostructureAnalyzer;
use crate::analyzers::orderbook::OrderbookAnalyzer;
use crate::analyzers::orderflow::OrderFlowAnalyzer;
use crate::analyzers::technical::TechnicalIndicators;
use crate::breaker::CircuitBreaker;
use crate::config::SharedConfig;
use crate::models::{EarlySignal, MarketEvent, OrderbookSnapshot, Tick};
use crate::signals::correlator::CrossMarketCorrelator;
use crate::signals::dedup::SignalGate;
use crate::signals::detector::SignalDetector;
use crate::sink::{MarketCatalog, SignalSink, SignalWriter};
use crate::stream::StreamIngestor;

/// Frame-latency samples kept for the p95 housekeeping stat.
const LATENCY_SAMPLES: usize = 256;
/// Aggressive cleanup: markets idle this long get trimmed to `KEEP_POINTS`.
const INACTIVE_AFTER_MS: i64 = 10 * 60 * 1000;
const KEEP_POINTS: usize = 50;

#[derive(Debug, Default)]
struct EngineStats {
    started_at_ms: i64,
    frames: u64,
    ticks: u64,
    books: u64,
    signals_emitted: u64,
    signals_suppressed: u64,
    analyzer_errors: u64,
    catalog_scans: u64,
    frame_latency_us: VecDeque<u64>,
}

impl EngineStats {
    fn record_latency(&mut self, us: u64) {
        if self.frame_latency_us.len() >= LATENCY_SAMPLES {
            self.frame_latency_us.pop_front();
        }
        self.frame_latency_us.push_back(us);
    }

    fn p95_latency_us(&self) -> Option<u64> {
        if self.frame_latency_us.len() < 20 {
            return None;
        }
        let mut samples: Vec<u64> = self.frame_latency_us.iter().copied().collect();
        samples.sort_unstable();
        let index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        samples.get(index).copied()
    }
}

/// Point-in-time engine health, served to operators and the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub connection: &'static str,
    pub uptime_ms: i64,
    pub tracked_markets: usize,
    pub frames_processed: u64,
    pub signals_emitted: u64,
    pub analyzer_errors: u64,
    pub technical_markets: usize,
    pub orderbook_markets: usize,
    pub microstructure_markets: usize,
    pub orderflow_markets: usize,
    pub buffered_points: usize,
}

/// The orchestrator (C10).
pub struct MicrostructureDetector {
    config: SharedConfig,
    technical: TechnicalIndicators,
    orderbooks: OrderbookAnalyzer,
    micro: MicrostructureAnalyzer,
    flow: OrderFlowAnalyzer,
    frontrun: FrontRunScorer,
    detector: SignalDetector,
    correlator: CrossMarketCorrelator,
    gate: SignalGate,
    sink: Arc<dyn SignalSink>,
    writer: Arc<dyn SignalWriter>,
    tracked: Arc<RwLock<HashSet<String>>>,
    ingestor: Option<Arc<StreamIngestor>>,
    running: Arc<AtomicBool>,
    stats: EngineStats,
}

impl MicrostructureDetector {
    pub fn new(
        config: SharedConfig,
        sink: Arc<dyn SignalSink>,
        writer: Arc<dyn SignalWriter>,
    ) -> Self {
        Self {
            technical: TechnicalIndicators::new(config.clone()),
            orderbooks: OrderbookAnalyzer::new(config.clone()),
            micro: MicrostructureAnalyzer::new(config.clone()),
            flow: OrderFlowAnalyzer::new(config.clone()),
            frontrun: FrontRunScorer::new(config.clone()),
            detector: SignalDetector::new(config.clone()),
            correlator: CrossMarketCorrelator::new(config.clone()),
            gate: SignalGate::new(config.clone()),
            config,
            sink,
            writer,
            tracked: Arc::new(RwLock::new(HashSet::new())),
            ingestor: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: EngineStats::default(),
        }
    }

    /// Wire the stream ingestor so track/untrack manage subscriptions and
    /// shutdown can disconnect.
    pub fn attach_ingestor(&mut self, ingestor: Arc<StreamIngestor>) {
        self.ingestor = Some(ingestor);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Shared view of the tracked-market set for the control plane.
    pub fn tracked_handle(&self) -> Arc<RwLock<HashSet<String>>> {
        self.tracked.clone()
    }

    pub fn track_market(&self, market_id: &str) {
        let config = self.config.load();
        let mut tracked = self.tracked.write();
        if tracked.len() >= config.max_markets_to_track && !tracked.contains(market_id) {
            warn!(
                market = %market_id,
                cap = config.max_markets_to_track,
                "tracked-market cap reached; refusing to add"
            );
            return;
        }
        if tracked.insert(market_id.to_string()) {
            info!(market = %market_id, "🎯 tracking market");
            if let Some(ingestor) = &self.ingestor {
                ingestor.subscribe(market_id);
            }
        }
    }

    pub fn untrack_market(&self, market_id: &str) {
        if self.tracked.write().remove(market_id) {
            info!(market = %market_id, "untracking market");
            if let Some(ingestor) = &self.ingestor {
                ingestor.unsubscribe(market_id);
            }
        }
    }

    /// Dispatch one stream event through the analyzer chain.
    pub async fn handle_event(&mut self, event: MarketEvent) {
        // An explicitly tracked set filters the stream; an empty set means
        // "analyze whatever arrives" for embedded use.
        {
            let tracked = self.tracked.read();
            if !tracked.is_empty() && !tracked.contains(event.market_id()) {
                debug!(market = %event.market_id(), "event for untracked market dropped");
                return;
            }
        }

        let started = Instant::now();
        self.stats.frames += 1;
        counter!("polysight_frames_total", 1);

        match event {
            MarketEvent::Tick(tick) => self.on_tick(tick).await,
            MarketEvent::Book(book) => self.on_book(book).await,
        }

        self.stats.record_latency(started.elapsed().as_micros() as u64);
    }

    async fn on_tick(&mut self, tick: Tick) {
        self.stats.ticks += 1;
        if let Err(e) = self.writer.write_tick(&tick).await {
            debug!(error = %e, "tick persistence failed");
        }

        let market_id = tick.market_id.clone();
        let Some(update) = self.guarded("technical", &market_id, |s| {
            s.flow.on_tick(&tick);
            s.technical.on_tick(&tick)
        }) else {
            return;
        };

        if !update.signals.is_empty() {
            self.emit_signals(update.signals, tick.timestamp_ms, true).await;
        }
    }

    /// Run one analyzer stage behind a panic boundary (the orchestrator-level
    /// exception catch). A panicking stage increments the error counter and
    /// abandons the frame; per-market buffers are left as they were.
    fn guarded<T>(
        &mut self,
        stage: &'static str,
        market: &str,
        f: impl FnOnce(&mut Self) -> T,
    ) -> Option<T> {
        let result = {
            let this = &mut *self;
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || f(this)))
        };
        match result {
            Ok(value) => Some(value),
            Err(_) => {
                self.stats.analyzer_errors += 1;
                counter!("polysight_analyzer_errors_total", 1);
                error!(stage, market = %market, "analyzer panicked; frame abandoned");
                None
            }
        }
    }

    async fn on_book(&mut self, book: OrderbookSnapshot) {
        self.stats.books += 1;
        if let Err(e) = self.writer.write_orderbook(&book).await {
            debug!(error = %e, "orderbook persistence failed");
        }

        let market_id = book.market_id.clone();
        let mut signals = Vec::new();

        // C4 -> C5 -> C6 in order, then C7 fed by C5's output. Each stage is
        // panic-guarded: a failing analyzer abandons the frame but keeps its
        // ring buffers and the rest of the engine intact.
        let Some(book_analysis) =
            self.guarded("orderbook", &market_id, |s| s.orderbooks.analyze(&book))
        else {
            return;
        };
        signals.extend(book_analysis.signals);

        let Some(micro_update) =
            self.guarded("microstructure", &market_id, |s| s.micro.analyze(&book))
        else {
            return;
        };
        signals.extend(micro_update.signals);

        let Some(flow_update) = self.guarded("orderflow", &market_id, |s| s.flow.analyze(&book))
        else {
            return;
        };
        signals.extend(flow_update.signals);

        let evidence = self.cross_market_evidence(&market_id);
        let Some((assessment, leak_signal)) = self.guarded("front_running", &market_id, |s| {
            s.frontrun.assess(
                &micro_update.metrics,
                &market_id,
                (!evidence.is_empty()).then_some(evidence.as_slice()),
            )
        }) else {
            return;
        };
        signals.extend(leak_signal);

        if let Err(e) = self
            .writer
            .write_micro_metrics(&market_id, &micro_update.metrics)
            .await
        {
            debug!(error = %e, "microstructure persistence failed");
        }
        if let Err(e) = self.writer.write_front_running(&assessment).await {
            debug!(error = %e, "front-running persistence failed");
        }

        if !signals.is_empty() {
            self.emit_signals(signals, book.timestamp_ms, true).await;
        }
    }

    /// Peer evidence for the front-running scorer: correlated markets from
    /// the last correlation pass, with their current imbalance z-scores.
    fn cross_market_evidence(&self, market_id: &str) -> Vec<CrossMarketEvidence> {
        let Some(peers) = self.correlator.peers(market_id) else {
            return Vec::new();
        };
        peers
            .iter()
            .map(|peer| CrossMarketEvidence {
                market_id: peer.market_id.clone(),
                correlation: peer.price_correlation,
                imbalance_z: self
                    .micro
                    .latest_metrics(&peer.market_id)
                    .and_then(|m| m.imbalance_z),
            })
            .collect()
    }

    /// Enrich, gate and deliver a batch of signals.
    async fn emit_signals(&mut self, signals: Vec<EarlySignal>, now_ms: i64, microstructure: bool) {
        let produced = signals.len();
        let mut enriched = Vec::with_capacity(produced);
        for mut signal in signals {
            self.enrich(&mut signal, now_ms);
            enriched.push(signal);
        }

        let admitted = self.gate.admit_batch(enriched, now_ms);
        self.stats.signals_suppressed += (produced - admitted.len()) as u64;

        for signal in admitted {
            self.stats.signals_emitted += 1;
            counter!("polysight_signals_total", 1);
            if let Err(e) = self.writer.write_signal(&signal).await {
                debug!(error = %e, "signal persistence failed");
            }
            if microstructure && signal.kind.is_microstructure() {
                self.sink.on_microstructure_signal(&signal).await;
            } else {
                self.sink.on_signal(&signal).await;
            }
        }
    }

    fn enrich(&self, signal: &mut EarlySignal, now_ms: i64) {
        let indicators = self
            .technical
            .latest_snapshot(&signal.market_id)
            .and_then(|s| serde_json::to_value(s).ok());
        let orderbook = self
            .orderbooks
            .latest_metrics(&signal.market_id)
            .and_then(|m| serde_json::to_value(m).ok());

        signal.merge_metadata(serde_json::json!({
            "enrichment": {
                "detected_at_ms": now_ms,
                "indicators": indicators,
                "orderbook": orderbook,
            }
        }));
    }

    /// Periodic catalog scan (T4): coarse detection plus the correlation batch.
    pub async fn catalog_scan(
        &mut self,
        catalog: &Arc<dyn MarketCatalog>,
        breaker: &mut CircuitBreaker,
    ) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        if !breaker.allow(now_ms) {
            debug!("catalog breaker open; skipping this cycle");
            return;
        }

        let markets = match catalog.fetch_markets().await {
            Ok(markets) => {
                breaker.record_success();
                markets
            }
            Err(e) => {
                breaker.record_failure(now_ms, &e.to_string());
                return;
            }
        };

        self.stats.catalog_scans += 1;
        gauge!("polysight_catalog_markets", markets.len() as f64);

        for market in &markets {
            if market.active && !market.closed {
                self.correlator.record(market, now_ms);
            }
        }

        let mut signals = self.detector.scan(&markets, now_ms);
        signals.extend(self.correlator.scan(now_ms));
        if !signals.is_empty() {
            self.emit_signals(signals, now_ms, false).await;
        }
    }

    /// Housekeeping (T3): stats log, stale-market cleanup, health report,
    /// memory-ceiling enforcement.
    pub async fn housekeeping(&mut self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let config = self.config.load();

        let evicted = self.technical.cleanup_stale_markets(now_ms)
            + self.orderbooks.cleanup_stale_markets(now_ms)
            + self.micro.cleanup_stale_markets(now_ms)
            + self.flow.cleanup_stale_markets(now_ms)
            + self.frontrun.cleanup_stale_markets(now_ms)
            + self.detector.cleanup_stale_markets(now_ms)
            + self.correlator.cleanup_stale_markets(now_ms);
        self.gate.prune(now_ms);

        let buffered = self.buffered_points();
        if buffered > config.memory_ceiling_points {
            error!(
                buffered,
                ceiling = config.memory_ceiling_points,
                "🛑 memory ceiling exceeded; trimming inactive markets to {KEEP_POINTS} points"
            );
            self.technical.aggressive_trim(now_ms, INACTIVE_AFTER_MS, KEEP_POINTS);
            self.orderbooks.aggressive_trim(now_ms, INACTIVE_AFTER_MS, KEEP_POINTS);
            self.micro.aggressive_trim(now_ms, INACTIVE_AFTER_MS, KEEP_POINTS);
            self.flow.aggressive_trim(now_ms, INACTIVE_AFTER_MS, KEEP_POINTS);
        }

        let health = self.health();
        gauge!("polysight_tracked_markets", health.tracked_markets as f64);
        gauge!("polysight_buffered_points", health.buffered_points as f64);
        info!(
            frames = self.stats.frames,
            ticks = self.stats.ticks,
            books = self.stats.books,
            signals = self.stats.signals_emitted,
            suppressed = self.stats.signals_suppressed,
            errors = self.stats.analyzer_errors,
            evicted,
            buffered,
            p95_frame_us = self.stats.p95_latency_us().unwrap_or(0),
            healthy = health.healthy,
            "📊 engine housekeeping"
        );
    }

    fn buffered_points(&self) -> usize {
        self.technical.buffered_points()
            + self.orderbooks.buffered_points()
            + self.micro.buffered_points()
            + self.flow.buffered_points()
            + self.frontrun.buffered_points()
            + self.detector.buffered_points()
            + self.correlator.buffered_points()
    }

    pub fn health(&self) -> HealthReport {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let connection = self
            .ingestor
            .as_ref()
            .map(|i| i.connection_state().as_str())
            .unwrap_or("detached");
        let healthy = self.is_running() && connection != "disconnected";

        HealthReport {
            healthy,
            connection,
            uptime_ms: now_ms - self.stats.started_at_ms,
            tracked_markets: self.tracked.read().len(),
            frames_processed: self.stats.frames,
            signals_emitted: self.stats.signals_emitted,
            analyzer_errors: self.stats.analyzer_errors,
            technical_markets: self.technical.market_count(),
            orderbook_markets: self.orderbooks.market_count(),
            microstructure_markets: self.micro.market_count(),
            orderflow_markets: self.flow.market_count(),
            buffered_points: self.buffered_points(),
        }
    }

    /// Main dispatch loop (T2). Consumes stream events, drives the
    /// housekeeping and catalog timers, and exits on shutdown or when the
    /// event channel closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<MarketEvent>,
        catalog: Option<Arc<dyn MarketCatalog>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let config = self.config.load();
        self.running.store(true, Ordering::Relaxed);
        self.stats.started_at_ms = chrono::Utc::now().timestamp_millis();
        info!(
            check_interval_ms = config.check_interval_ms,
            housekeeping_interval_ms = config.housekeeping_interval_ms,
            "🚀 microstructure engine running"
        );

        let mut housekeeping = interval(Duration::from_millis(config.housekeeping_interval_ms));
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut catalog_timer = interval(Duration::from_millis(config.check_interval_ms));
        catalog_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut breaker = CircuitBreaker::new(
            "catalog",
            config.catalog_breaker_failures,
            config.catalog_breaker_cooldown_ms,
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("event channel closed; stopping");
                            break;
                        }
                    }
                }
                _ = housekeeping.tick() => self.housekeeping().await,
                _ = catalog_timer.tick() => {
                    if let Some(catalog) = catalog.clone() {
                        self.catalog_scan(&catalog, &mut breaker).await;
                    }
                }
            }
        }

        self.stop();
        Ok(())
    }

    /// Cooperative stop: flag down, ingestor disconnected, buffers released.
    /// In-flight frames have already completed (single dispatch task).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(ingestor) = &self.ingestor {
            ingestor.shutdown();
        }
        self.technical.dispose();
        self.orderbooks.dispose();
        self.micro.dispose();
        self.flow.dispose();
        self.frontrun.dispose();
        self.detector.dispose();
        self.correlator.dispose();
        info!(
            frames = self.stats.frames,
            signals = self.stats.signals_emitted,
            "engine stopped"
        );
    }
}
