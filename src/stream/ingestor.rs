//! WebSocket stream ingestor.
//!
//! One worker task owns the socket: a command channel carries
//! subscribe/unsubscribe requests, a ping timer keeps the connection alive,
//! and parsed frames are handed to the orchestrator over an mpsc channel.
//! Reconnects re-issue every live subscription; the subscription set is the
//! single source of truth for what "connected" means.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::SharedConfig;
use crate::models::MarketEvent;

use super::frames::{parse_frame, StreamFrame};

const PING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

/// Connection lifecycle. `Connecting` is reentrancy-guarded: a second
/// attempt while one is in flight is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Tracked subscriptions: one logical (trades + book) subscription per
/// market. Deterministic iteration keeps resubscribe payloads stable.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    markets: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn add(&mut self, market: &str) -> bool {
        let market = market.trim();
        !market.is_empty() && self.markets.insert(market.to_string())
    }

    pub fn remove(&mut self, market: &str) -> bool {
        self.markets.remove(market.trim())
    }

    pub fn contains(&self, market: &str) -> bool {
        self.markets.contains(market)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Payloads to (re-)issue for every tracked market: one trades and one
    /// book subscription each.
    pub fn resubscribe_payloads(&self) -> Vec<serde_json::Value> {
        let mut payloads = Vec::with_capacity(self.markets.len() * 2);
        for market in &self.markets {
            for channel in ["trades", "book"] {
                payloads.push(serde_json::json!({
                    "operation": "subscribe",
                    "channel": channel,
                    "market": market,
                }));
            }
        }
        payloads
    }

    pub fn unsubscribe_payloads(&self, market: &str) -> Vec<serde_json::Value> {
        ["trades", "book"]
            .into_iter()
            .map(|channel| {
                serde_json::json!({
                    "operation": "unsubscribe",
                    "channel": channel,
                    "market": market,
                })
            })
            .collect()
    }
}

/// Exponential backoff: base * 2^attempt, capped.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(exp.min(cap_ms))
}

/// Stream ingestor handle (C9). The worker task is spawned once; the handle
/// is cheap to clone around the control plane.
pub struct StreamIngestor {
    config: SharedConfig,
    cmd_tx: mpsc::Sender<WsCommand>,
    state: Arc<RwLock<ConnectionState>>,
    subscriptions: Arc<RwLock<SubscriptionSet>>,
}

impl StreamIngestor {
    /// Spawn the worker and return the control handle. Parsed events land on
    /// `events`.
    pub fn spawn(config: SharedConfig, events: mpsc::Sender<MarketEvent>) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<WsCommand>(1024);
        let ingestor = Arc::new(Self {
            config,
            cmd_tx,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            subscriptions: Arc::new(RwLock::new(SubscriptionSet::default())),
        });

        let worker = ingestor.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run(cmd_rx, events).await {
                error!(error = %e, "stream ingestor worker exited");
            }
        });

        ingestor
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Request a market subscription. Non-blocking; idempotent.
    pub fn subscribe(&self, market: &str) {
        if market.trim().is_empty() {
            return;
        }
        let _ = self
            .cmd_tx
            .try_send(WsCommand::Subscribe(market.trim().to_string()));
    }

    pub fn unsubscribe(&self, market: &str) {
        let _ = self
            .cmd_tx
            .try_send(WsCommand::Unsubscribe(market.trim().to_string()));
    }

    /// Cooperative shutdown; the worker drops the socket and exits.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(WsCommand::Shutdown);
    }

    /// Guard against overlapping connection attempts.
    fn begin_connecting(&self, reconnecting: bool) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Connecting {
            return false;
        }
        *state = if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        true
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write() = next;
    }

    async fn run(
        self: Arc<Self>,
        mut cmd_rx: mpsc::Receiver<WsCommand>,
        events: mpsc::Sender<MarketEvent>,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        let mut reconnecting = false;

        loop {
            // Nothing to stream until someone subscribes.
            while self.subscriptions.read().is_empty() {
                match cmd_rx.recv().await {
                    Some(WsCommand::Subscribe(market)) => {
                        self.subscriptions.write().add(&market);
                    }
                    Some(WsCommand::Unsubscribe(market)) => {
                        self.subscriptions.write().remove(&market);
                    }
                    Some(WsCommand::Shutdown) | None => {
                        self.set_state(ConnectionState::Disconnected);
                        return Ok(());
                    }
                }
            }

            if !self.begin_connecting(reconnecting) {
                // Another attempt is already in flight on this worker; yield.
                sleep(Duration::from_millis(50)).await;
                continue;
            }

            match self.connect_and_stream(&mut cmd_rx, &events).await {
                Ok(ExitReason::Shutdown) => {
                    self.set_state(ConnectionState::Disconnected);
                    info!("stream ingestor stopped");
                    return Ok(());
                }
                Ok(ExitReason::StreamEnded) => {
                    attempt = 0;
                    reconnecting = true;
                    self.set_state(ConnectionState::Reconnecting);
                    warn!("stream ended; reconnecting");
                }
                Err(e) => {
                    let config = self.config.load();
                    attempt += 1;
                    if attempt >= config.ingest.max_reconnect_attempts {
                        error!(
                            error = %e,
                            attempts = attempt,
                            "giving up on the stream after repeated failures"
                        );
                        self.set_state(ConnectionState::Disconnected);
                        return Err(e);
                    }
                    let delay = backoff_delay(
                        attempt,
                        config.ingest.reconnect_base_ms,
                        config.ingest.reconnect_cap_ms,
                    );
                    warn!(error = %e, attempt, ?delay, "connect failed; backing off");
                    self.set_state(ConnectionState::Reconnecting);
                    reconnecting = true;
                    sleep(delay).await;
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<WsCommand>,
        events: &mpsc::Sender<MarketEvent>,
    ) -> Result<ExitReason> {
        let config = self.config.load();
        info!(url = %config.ingest.ws_url, "🔌 connecting to market stream");
        let (ws_stream, resp) = connect_async(config.ingest.ws_url.as_str())
            .await
            .context("websocket connect")?;
        info!(status = %resp.status(), "✅ market stream connected");
        self.set_state(ConnectionState::Connected);

        let (mut write, mut read) = ws_stream.split();

        // (Re-)issue every live subscription.
        let payloads = self.subscriptions.read().resubscribe_payloads();
        for payload in payloads {
            write
                .send(Message::Text(payload.to_string()))
                .await
                .context("send subscription")?;
        }

        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let _ = write.send(Message::Text("PING".to_string())).await;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WsCommand::Subscribe(market)) => {
                            if self.subscriptions.write().add(&market) {
                                for channel in ["trades", "book"] {
                                    let payload = serde_json::json!({
                                        "operation": "subscribe",
                                        "channel": channel,
                                        "market": market,
                                    });
                                    let _ = write.send(Message::Text(payload.to_string())).await;
                                }
                            }
                        }
                        Some(WsCommand::Unsubscribe(market)) => {
                            if self.subscriptions.write().remove(&market) {
                                let payloads = self.subscriptions.read().unsubscribe_payloads(&market);
                                for payload in payloads {
                                    let _ = write.send(Message::Text(payload.to_string())).await;
                                }
                            }
                        }
                        Some(WsCommand::Shutdown) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(ExitReason::Shutdown);
                        }
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Ok(ExitReason::StreamEnded);
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            if self.handle_text(&text, events).await.is_err() {
                                // Orchestrator went away; nothing left to feed.
                                return Ok(ExitReason::Shutdown);
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "stream close frame");
                            return Ok(ExitReason::StreamEnded);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("stream error: {e}"));
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(
        &self,
        text: &str,
        events: &mpsc::Sender<MarketEvent>,
    ) -> Result<(), ()> {
        let config = self.config.load();
        let now_ms = chrono::Utc::now().timestamp_millis();

        match parse_frame(text, config.ingest.max_frame_bytes, now_ms) {
            Ok(Some(StreamFrame::Trade(tick))) => {
                events.send(MarketEvent::Tick(tick)).await.map_err(|_| ())?;
            }
            Ok(Some(StreamFrame::Book(snapshot))) => {
                events.send(MarketEvent::Book(snapshot)).await.map_err(|_| ())?;
            }
            Ok(Some(StreamFrame::Subscription)) => {
                debug!("subscription acknowledged");
            }
            Ok(Some(StreamFrame::Error(message))) => {
                warn!(message = %message, "stream reported an error");
            }
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "dropped invalid frame");
            }
        }
        Ok(())
    }
}

enum ExitReason {
    Shutdown,
    StreamEnded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_reissues_every_subscription_without_duplicates() {
        let mut subs = SubscriptionSet::default();
        assert!(subs.add("mkt-a"));
        assert!(subs.add("mkt-b"));
        assert!(subs.add("mkt-c"));
        // Re-subscribing an existing market must not duplicate it.
        assert!(!subs.add("mkt-a"));
        assert_eq!(subs.len(), 3);

        let payloads = subs.resubscribe_payloads();
        // Exactly 3 trade and 3 book subscriptions.
        assert_eq!(payloads.len(), 6);
        let trades = payloads
            .iter()
            .filter(|p| p["channel"] == "trades")
            .count();
        let books = payloads.iter().filter(|p| p["channel"] == "book").count();
        assert_eq!(trades, 3);
        assert_eq!(books, 3);

        // A second reconnect produces the same set again.
        assert_eq!(subs.resubscribe_payloads().len(), 6);
    }

    #[test]
    fn unsubscribe_shrinks_the_set() {
        let mut subs = SubscriptionSet::default();
        subs.add("mkt-a");
        subs.add("mkt-b");
        assert!(subs.remove("mkt-a"));
        assert!(!subs.remove("mkt-a"));
        assert_eq!(subs.resubscribe_payloads().len(), 2);
    }

    #[test]
    fn blank_market_ids_are_rejected() {
        let mut subs = SubscriptionSet::default();
        assert!(!subs.add(""));
        assert!(!subs.add("   "));
        assert!(subs.is_empty());
    }

    #[test]
    fn backoff_grows_exponentially_to_the_cap() {
        assert_eq!(backoff_delay(0, 1000, 30_000), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1, 1000, 30_000), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3, 1000, 30_000), Duration::from_millis(8000));
        assert_eq!(backoff_delay(10, 1000, 30_000), Duration::from_millis(30_000));
        // Large attempt counts must not overflow.
        assert_eq!(backoff_delay(60, 1000, 30_000), Duration::from_millis(30_000));
    }
}
