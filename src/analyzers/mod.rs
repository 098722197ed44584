//! Per-market analyzers (C3-C7). Each one exclusively owns its ring-buffer
//! state and is driven frame-by-frame by the orchestrator.

pub mod frontrun;
pub mod microstructure;
pub mod orderbook;
pub mod orderflow;
pub mod technical;

pub use frontrun::{FrontRunAssessment, FrontRunScorer};
pub use microstructure::{MicroMetrics, MicrostructureAnalyzer};
pub use orderbook::{BookMetrics, OrderbookAnalyzer};
pub use orderflow::{FlowMetrics, OrderFlowAnalyzer};
pub use technical::{TechnicalIndicators, TechnicalSnapshot};
