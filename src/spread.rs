//! Canonical spread conversions.
//!
//! Every spread here is the decimal difference `ask - bid` of two
//! probabilities, so it already lives in [0, 1]. None of these functions may
//! divide by mid price or best ask: doing so would make the result depend on
//! where in the probability range the market trades, and a 0.027 spread at
//! 0.02 would score wildly differently from the same spread at 0.50.

use anyhow::{bail, Result};

/// Default denominator for tightness: 1000 bps = a 0.10 probability spread.
pub const DEFAULT_MAX_BPS: f64 = 1000.0;

/// Decimal spread to basis points. 0.027 -> 270.
pub fn spread_bps(spread: f64) -> f64 {
    spread * 10_000.0
}

/// Decimal spread to percent. 0.027 -> 2.7.
pub fn spread_percent(spread: f64) -> f64 {
    spread * 100.0
}

/// Tightness in [0, 1]: 1 at zero spread, 0 at `max_bps` and beyond.
pub fn spread_tightness(spread: f64, max_bps: f64) -> f64 {
    if max_bps <= 0.0 {
        return 0.0;
    }
    (1.0 - spread_bps(spread) / max_bps).clamp(0.0, 1.0)
}

/// Tightness with the default 1000 bps ceiling.
pub fn spread_tightness_default(spread: f64) -> f64 {
    spread_tightness(spread, DEFAULT_MAX_BPS)
}

/// Probability spreads must lie in [0, 1] and be finite.
pub fn validate_spread(spread: f64) -> Result<f64> {
    if !spread.is_finite() {
        bail!("spread must be finite, got {spread}");
    }
    if spread < 0.0 {
        bail!("spread must be >= 0, got {spread}");
    }
    if spread > 1.0 {
        bail!("spread must be <= 1 for probability markets, got {spread}");
    }
    Ok(spread)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discord_spread_case() {
        // bid = 0.011, ask = 0.038
        let spread: f64 = 0.038 - 0.011;
        assert!((spread - 0.027).abs() < 1e-12);
        assert!((spread_bps(spread) - 270.0).abs() < 1e-9);
        assert!((spread_percent(spread) - 2.7).abs() < 1e-9);
        assert!((spread_tightness_default(spread) - 0.73).abs() < 1e-9);
    }

    #[test]
    fn equal_spreads_are_level_independent() {
        // Same 0.05 spread at low, mid and high probability.
        let pairs = [(0.10, 0.15), (0.45, 0.50), (0.85, 0.90)];
        let bps: Vec<f64> = pairs.iter().map(|(b, a)| spread_bps(a - b)).collect();

        for v in &bps {
            assert!((v - 500.0).abs() < 1.0, "expected ~500 bps, got {v}");
        }
        for pair in bps.windows(2) {
            assert!((pair[0] - pair[1]).abs() < 1.0);
        }
    }

    #[test]
    fn tightness_clamps() {
        assert_eq!(spread_tightness(0.5, DEFAULT_MAX_BPS), 0.0);
        assert_eq!(spread_tightness(0.0, DEFAULT_MAX_BPS), 1.0);
        assert_eq!(spread_tightness(0.05, 0.0), 0.0);
    }

    #[test]
    fn validation_rejects_out_of_range() {
        assert!(validate_spread(-0.01).is_err());
        assert!(validate_spread(1.01).is_err());
        assert!(validate_spread(f64::NAN).is_err());
        assert_eq!(validate_spread(0.027).unwrap(), 0.027);
    }
}
