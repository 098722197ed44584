//! Bounded trade history with streaming trade statistics.

use crate::models::{Side, Tick};

use super::ring::RingBuffer;

#[derive(Debug, Clone)]
pub struct TickBuffer {
    ring: RingBuffer<Tick>,
}

impl TickBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
        }
    }

    pub fn push(&mut self, tick: Tick) {
        self.ring.push(tick);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn latest(&self) -> Option<&Tick> {
        self.ring.latest()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tick> {
        self.ring.iter()
    }

    pub fn trim_to_size(&mut self, n: usize) {
        self.ring.trim_to_size(n);
    }

    pub fn dispose(&mut self) {
        self.ring.dispose();
    }

    /// Ticks within `window_ms` of the newest tick (deterministic for replay).
    pub fn window(&self, window_ms: i64) -> Vec<&Tick> {
        let Some(latest) = self.ring.latest() else {
            return Vec::new();
        };
        self.ring.since(latest.timestamp_ms - window_ms, |t| t.timestamp_ms)
    }

    /// Volume-weighted average price over the window.
    ///
    /// Weighted by per-trade size, never by cumulative volume: the 24h
    /// cumulative figure carried on catalog rows would weight every trade by
    /// the whole market's history.
    pub fn vwap(&self, window_ms: i64) -> Option<f64> {
        let ticks = self.window(window_ms);
        let total_size: f64 = ticks.iter().map(|t| t.size).sum();
        if total_size <= 0.0 {
            return None;
        }
        let weighted: f64 = ticks.iter().map(|t| t.price * t.size).sum();
        Some(weighted / total_size)
    }

    /// Relative price change over the last `n` ticks, percent.
    pub fn momentum(&self, n: usize) -> Option<f64> {
        let len = self.ring.len();
        if n == 0 || len <= n {
            return None;
        }
        let current = self.ring.get(len - 1)?.price;
        let past = self.ring.get(len - 1 - n)?.price;
        if past <= 0.0 {
            return None;
        }
        Some((current - past) / past * 100.0)
    }

    /// (average, max) trade size over the window.
    pub fn size_stats(&self, window_ms: i64) -> Option<(f64, f64)> {
        let ticks = self.window(window_ms);
        if ticks.is_empty() {
            return None;
        }
        let max = ticks.iter().map(|t| t.size).fold(0.0_f64, f64::max);
        let avg = ticks.iter().map(|t| t.size).sum::<f64>() / ticks.len() as f64;
        Some((avg, max))
    }

    /// Net signed size (buys - sells) over the window.
    pub fn signed_flow(&self, window_ms: i64) -> f64 {
        self.window(window_ms)
            .iter()
            .map(|t| match t.side {
                Side::Buy => t.size,
                Side::Sell => -t.size,
            })
            .sum()
    }
}
