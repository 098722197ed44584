//! Market stream ingestion (C9).

pub mod frames;
pub mod ingestor;

pub use frames::{parse_frame, StreamFrame};
pub use ingestor::{ConnectionState, StreamIngestor, SubscriptionSet};
