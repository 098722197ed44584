//! Per-collaborator circuit breaker.
//!
//! Opens after a run of consecutive failures, half-opens after a cooldown to
//! let one probe through, and closes again on the first success. Guards the
//! catalog and persistence paths so a dead collaborator costs one skipped
//! cycle instead of a stall.

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { since_ms: i64 },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown_ms: i64,
    consecutive_failures: u32,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown_ms: i64) -> Self {
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            cooldown_ms,
            consecutive_failures: 0,
            state: BreakerState::Closed,
        }
    }

    /// Whether a call may proceed now. Transitions Open -> HalfOpen once the
    /// cooldown has elapsed.
    pub fn allow(&mut self, now_ms: i64) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { since_ms } => {
                if now_ms - since_ms >= self.cooldown_ms {
                    info!(breaker = self.name, "circuit half-open, probing");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!(breaker = self.name, "✅ circuit closed");
        }
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self, now_ms: i64, reason: &str) {
        self.consecutive_failures += 1;
        warn!(
            breaker = self.name,
            failures = self.consecutive_failures,
            reason,
            "⚠️ collaborator failure recorded"
        );

        let should_open = match self.state {
            // A failed probe reopens immediately.
            BreakerState::HalfOpen => true,
            BreakerState::Closed => self.consecutive_failures >= self.failure_threshold,
            BreakerState::Open { .. } => false,
        };
        if should_open {
            error!(breaker = self.name, reason, "🛑 circuit opened");
            self.state = BreakerState::Open { since_ms: now_ms };
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new("test", 3, 60_000);
        assert!(breaker.allow(0));
        breaker.record_failure(0, "timeout");
        breaker.record_failure(1, "timeout");
        assert!(breaker.allow(2));
        breaker.record_failure(2, "timeout");
        assert!(breaker.is_open());
        assert!(!breaker.allow(3));
    }

    #[test]
    fn half_opens_after_cooldown_and_closes_on_success() {
        let mut breaker = CircuitBreaker::new("test", 1, 60_000);
        breaker.record_failure(0, "boom");
        assert!(!breaker.allow(30_000));
        assert!(breaker.allow(60_000)); // half-open probe
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.allow(60_001));
    }

    #[test]
    fn failed_probe_reopens_immediately() {
        let mut breaker = CircuitBreaker::new("test", 3, 60_000);
        for i in 0..3 {
            breaker.record_failure(i, "boom");
        }
        assert!(breaker.allow(60_000)); // probe
        breaker.record_failure(60_001, "still down");
        assert!(breaker.is_open());
        assert!(!breaker.allow(60_002));
    }

    #[test]
    fn success_resets_the_failure_run() {
        let mut breaker = CircuitBreaker::new("test", 3, 60_000);
        breaker.record_failure(0, "blip");
        breaker.record_failure(1, "blip");
        breaker.record_success();
        breaker.record_failure(2, "blip");
        breaker.record_failure(3, "blip");
        assert!(!breaker.is_open());
    }
}
