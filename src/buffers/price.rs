//! Down-sampled price series with cross-series correlation.

use crate::models::PricePoint;
use crate::stats::mean_std;

use super::ring::RingBuffer;

#[derive(Debug, Clone)]
pub struct PriceBuffer {
    ring: RingBuffer<PricePoint>,
    min_interval_ms: i64,
}

impl PriceBuffer {
    pub fn new(capacity: usize, min_interval_ms: i64) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            min_interval_ms,
        }
    }

    /// Record a point, enforcing the down-sampling floor. Returns whether
    /// the point was stored.
    pub fn record(&mut self, point: PricePoint) -> bool {
        if let Some(last) = self.ring.latest() {
            if point.timestamp_ms - last.timestamp_ms < self.min_interval_ms {
                return false;
            }
        }
        self.ring.push(point);
        true
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn latest(&self) -> Option<&PricePoint> {
        self.ring.latest()
    }

    pub fn trim_to_size(&mut self, n: usize) {
        self.ring.trim_to_size(n);
    }

    pub fn dispose(&mut self) {
        self.ring.dispose();
    }

    pub fn window(&self, window_ms: i64) -> Vec<&PricePoint> {
        let Some(latest) = self.ring.latest() else {
            return Vec::new();
        };
        self.ring.since(latest.timestamp_ms - window_ms, |p| p.timestamp_ms)
    }

    pub fn avg_price(&self, window_ms: i64) -> Option<f64> {
        let prices: Vec<f64> = self.window(window_ms).iter().map(|p| p.price).collect();
        mean_std(&prices).map(|(mean, _)| mean)
    }

    /// Standard deviation of prices over the window.
    pub fn volatility(&self, window_ms: i64) -> Option<f64> {
        let prices: Vec<f64> = self.window(window_ms).iter().map(|p| p.price).collect();
        mean_std(&prices).map(|(_, sd)| sd)
    }

    /// Pearson correlation of prices against another buffer over the window.
    pub fn pearson_correlation(&self, other: &PriceBuffer, window_ms: i64) -> Option<f64> {
        self.pearson_with(other, window_ms, |p| p.price)
    }

    /// Pearson correlation of an arbitrary field (price, volume) against
    /// another buffer. Each of our points is aligned to the closest point in
    /// the other series at or before its timestamp; points with nothing
    /// earlier to align to are skipped.
    pub fn pearson_with<F>(&self, other: &PriceBuffer, window_ms: i64, field: F) -> Option<f64>
    where
        F: Fn(&PricePoint) -> f64,
    {
        let ours = self.window(window_ms);
        if ours.len() < 3 {
            return None;
        }

        let mut xs = Vec::with_capacity(ours.len());
        let mut ys = Vec::with_capacity(ours.len());
        for point in ours {
            if let Some(aligned) = other.closest_earlier(point.timestamp_ms) {
                xs.push(field(point));
                ys.push(field(aligned));
            }
        }
        if xs.len() < 3 {
            return None;
        }

        pearson(&xs, &ys)
    }

    /// Newest point with `timestamp <= ts_ms`.
    fn closest_earlier(&self, ts_ms: i64) -> Option<&PricePoint> {
        self.ring.iter().rev().find(|p| p.timestamp_ms <= ts_ms)
    }
}

fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys.iter()) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}
