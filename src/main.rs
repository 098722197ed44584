//! polysight runner: wires the stream ingestor to the detection engine with
//! the default log sink. Exit codes: 0 clean shutdown, 1 initialization
//! failure, 2 fatal runtime error.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polysight::config::{EngineConfig, SharedConfig};
use polysight::engine::MicrostructureDetector;
use polysight::sink::{LogSink, NoopWriter};
use polysight::stream::StreamIngestor;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,polysight=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    let shared = SharedConfig::new(config);

    let (event_tx, event_rx) = mpsc::channel(4096);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ingestor = StreamIngestor::spawn(shared.clone(), event_tx);
    let mut engine = MicrostructureDetector::new(shared, Arc::new(LogSink), Arc::new(NoopWriter));
    engine.attach_ingestor(ingestor.clone());

    // Seed subscriptions from the environment until the control plane takes
    // over (comma-separated market ids).
    if let Ok(markets) = std::env::var("TRACK_MARKETS") {
        for market in markets.split(',').filter(|m| !m.trim().is_empty()) {
            engine.track_market(market.trim());
        }
    }

    let engine_task = tokio::spawn(engine.run(event_rx, None, shutdown_rx));

    info!("polysight started; ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    let _ = shutdown_tx.send(true);

    match engine_task.await {
        Ok(Ok(())) => {
            info!("clean shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "engine exited with error");
            std::process::exit(2);
        }
        Err(e) => {
            error!(error = %e, "engine task panicked");
            std::process::exit(2);
        }
    }
}
