//! Bounded per-market history buffers.

pub mod orderbook;
pub mod price;
pub mod ring;
pub mod tick;

pub use orderbook::OrderbookBuffer;
pub use price::PriceBuffer;
pub use ring::RingBuffer;
pub use tick::TickBuffer;
