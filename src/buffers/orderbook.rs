//! Bounded orderbook snapshot history with spread statistics.

use crate::models::OrderbookSnapshot;
use crate::stats::mean_std;

use super::ring::RingBuffer;

#[derive(Debug, Clone)]
pub struct OrderbookBuffer {
    ring: RingBuffer<OrderbookSnapshot>,
}

impl OrderbookBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
        }
    }

    pub fn push(&mut self, snapshot: OrderbookSnapshot) {
        self.ring.push(snapshot);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn latest(&self) -> Option<&OrderbookSnapshot> {
        self.ring.latest()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrderbookSnapshot> {
        self.ring.iter()
    }

    pub fn trim_to_size(&mut self, n: usize) {
        self.ring.trim_to_size(n);
    }

    pub fn dispose(&mut self) {
        self.ring.dispose();
    }

    /// Snapshots within `window_ms` of the newest snapshot.
    pub fn window(&self, window_ms: i64) -> Vec<&OrderbookSnapshot> {
        let Some(latest) = self.ring.latest() else {
            return Vec::new();
        };
        self.ring.since(latest.timestamp_ms - window_ms, |s| s.timestamp_ms)
    }

    pub fn avg_spread(&self, window_ms: i64) -> Option<f64> {
        let spreads: Vec<f64> = self.window(window_ms).iter().map(|s| s.spread).collect();
        mean_std(&spreads).map(|(mean, _)| mean)
    }

    pub fn spread_volatility(&self, window_ms: i64) -> Option<f64> {
        let spreads: Vec<f64> = self.window(window_ms).iter().map(|s| s.spread).collect();
        mean_std(&spreads).map(|(_, sd)| sd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookLevel;

    fn book(ts: i64, bid: f64, ask: f64) -> OrderbookSnapshot {
        OrderbookSnapshot::new(
            ts,
            "mkt",
            vec![BookLevel::new(bid, 10.0)],
            vec![BookLevel::new(ask, 10.0)],
        )
    }

    #[test]
    fn avg_spread_over_window() {
        let mut buffer = OrderbookBuffer::new(10);
        buffer.push(book(1_000, 0.48, 0.50));
        buffer.push(book(2_000, 0.48, 0.52));

        let avg = buffer.avg_spread(60_000).unwrap();
        assert!((avg - 0.03).abs() < 1e-12);
    }

    #[test]
    fn spread_volatility_is_zero_for_constant_spread() {
        let mut buffer = OrderbookBuffer::new(10);
        for i in 0..5 {
            buffer.push(book(i * 1_000, 0.48, 0.50));
        }
        assert!(buffer.spread_volatility(60_000).unwrap() < 1e-12);
    }

    #[test]
    fn empty_buffer_has_no_statistics() {
        let buffer = OrderbookBuffer::new(10);
        assert!(buffer.avg_spread(60_000).is_none());
    }
}
