//! Fixed-capacity FIFO used for all per-market history.
//!
//! Memory is bounded by construction: pushing into a full buffer drops the
//! oldest element *before* the new one is inserted, so evicted items release
//! their allocations eagerly and nothing outlives its window.

use std::collections::VecDeque;

use chrono::Utc;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// O(1). Evicts (and drops) the oldest element when full.
    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    /// Insertion-order iterator, oldest first.
    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    pub fn get_all(&self) -> Vec<&T> {
        self.items.iter().collect()
    }

    /// Keep only the newest `n` elements.
    pub fn trim_to_size(&mut self, n: usize) {
        while self.items.len() > n {
            self.items.pop_front();
        }
    }

    /// Drop everything and release the backing storage.
    pub fn dispose(&mut self) {
        self.items.clear();
        self.items.shrink_to_fit();
    }

    /// Items with `ts(item) >= cutoff_ms`, oldest first.
    pub fn since<F>(&self, cutoff_ms: i64, ts: F) -> Vec<&T>
    where
        F: Fn(&T) -> i64,
    {
        self.items.iter().filter(|item| ts(item) >= cutoff_ms).collect()
    }

    /// Items within the trailing wall-clock window.
    pub fn get_in_window<F>(&self, window_ms: i64, ts: F) -> Vec<&T>
    where
        F: Fn(&T) -> i64,
    {
        let cutoff = Utc::now().timestamp_millis() - window_ms;
        self.since(cutoff, ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let mut ring: RingBuffer<usize> = RingBuffer::new(5);
        for i in 0..12 {
            ring.push(i);
        }

        assert_eq!(ring.len(), 5);
        // After k pushes into capacity N, the front is the (k - N + 1)-th item, 0-indexed k - N.
        assert_eq!(*ring.get_all()[0], 7);
        assert_eq!(*ring.latest().unwrap(), 11);
        assert_eq!(*ring.oldest().unwrap(), 7);
    }

    #[test]
    fn eviction_drops_old_allocations() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut ring = RingBuffer::new(2);
        for _ in 0..5 {
            ring.push(Tracked(drops.clone()));
        }

        // 5 pushed, 2 retained: 3 evicted items must already be dropped.
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        ring.dispose();
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn since_filters_by_timestamp() {
        let mut ring: RingBuffer<(i64, &str)> = RingBuffer::new(10);
        ring.push((100, "a"));
        ring.push((200, "b"));
        ring.push((300, "c"));

        let recent = ring.since(200, |item| item.0);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].1, "b");
    }

    #[test]
    fn trim_keeps_newest() {
        let mut ring: RingBuffer<usize> = RingBuffer::new(10);
        for i in 0..10 {
            ring.push(i);
        }
        ring.trim_to_size(3);
        assert_eq!(ring.len(), 3);
        assert_eq!(*ring.oldest().unwrap(), 7);
    }

    #[test]
    fn empty_queries_return_empty() {
        let ring: RingBuffer<(i64, f64)> = RingBuffer::new(4);
        assert!(ring.latest().is_none());
        assert!(ring.since(0, |item| item.0).is_empty());
    }

    #[test]
    fn zero_capacity_is_promoted_to_one() {
        let mut ring: RingBuffer<u8> = RingBuffer::new(0);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.len(), 1);
        assert_eq!(*ring.latest().unwrap(), 2);
    }
}
