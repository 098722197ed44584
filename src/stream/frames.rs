//! Wire-frame parsing and validation for the market stream.
//!
//! The feed is lenient JSON: envelope key is `type` or `channel`, prices
//! arrive as strings or numbers, book levels as objects or `[price, size]`
//! pairs, and market ids under `market` or `asset_id`. Everything is
//! validated here so a malformed frame dies at the boundary instead of
//! poisoning per-market state.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::models::{BookLevel, OrderbookSnapshot, Side, Tick};

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Trade(Tick),
    Book(OrderbookSnapshot),
    /// Subscription acknowledgements; consumed for logging only.
    Subscription,
    /// Server-reported error.
    Error(String),
}

/// Parse one text frame. `Ok(None)` means a recognized-but-ignorable frame
/// (pongs, unknown envelope types); `Err` means a frame that failed
/// validation and must be dropped with a debug log.
pub fn parse_frame(text: &str, max_frame_bytes: usize, now_ms: i64) -> Result<Option<StreamFrame>> {
    if text.len() > max_frame_bytes {
        bail!("frame of {} bytes exceeds the {} byte limit", text.len(), max_frame_bytes);
    }
    if text.eq_ignore_ascii_case("pong") || text.eq_ignore_ascii_case("ping") {
        return Ok(None);
    }

    let json: Value = serde_json::from_str(text).context("frame is not valid JSON")?;
    let envelope = json
        .get("type")
        .or_else(|| json.get("channel"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match envelope {
        "trade" | "trades" => Ok(Some(StreamFrame::Trade(parse_trade(&json, now_ms)?))),
        "book" | "orderbook" => Ok(Some(StreamFrame::Book(parse_book(&json, now_ms)?))),
        "subscription" => Ok(Some(StreamFrame::Subscription)),
        "error" => {
            let message = json
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified stream error")
                .to_string();
            Ok(Some(StreamFrame::Error(message)))
        }
        _ => Ok(None),
    }
}

fn market_id(json: &Value) -> Result<String> {
    let id = json
        .get("market")
        .or_else(|| json.get("asset_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if id.trim().is_empty() {
        bail!("frame missing market/asset_id");
    }
    Ok(id.trim().to_string())
}

/// Accept `0.52` or `"0.52"`. Rejects non-finite values.
fn lenient_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn timestamp_ms(json: &Value, now_ms: i64) -> i64 {
    json.get("timestamp")
        .and_then(lenient_f64)
        .map(|t| t as i64)
        .filter(|t| *t > 0)
        .unwrap_or(now_ms)
}

fn parse_trade(json: &Value, now_ms: i64) -> Result<Tick> {
    let market = market_id(json)?;
    let price = json
        .get("price")
        .and_then(lenient_f64)
        .context("trade missing price")?;
    if price <= 0.0 || price > 1.0 {
        bail!("trade price {price} outside (0, 1]");
    }

    let size = json
        .get("size")
        .or_else(|| json.get("volume"))
        .and_then(lenient_f64)
        .context("trade missing size")?;
    if size <= 0.0 {
        bail!("trade size {size} must be positive");
    }

    let side = match json.get("side").and_then(|v| v.as_str()) {
        Some(s) if s.eq_ignore_ascii_case("buy") => Side::Buy,
        Some(s) if s.eq_ignore_ascii_case("sell") => Side::Sell,
        Some(other) => bail!("unknown trade side {other:?}"),
        None => bail!("trade missing side"),
    };

    Ok(Tick::new(timestamp_ms(json, now_ms), market, price, size, side))
}

fn parse_levels(value: Option<&Value>) -> Result<Vec<BookLevel>> {
    let Some(Value::Array(raw)) = value else {
        return Ok(Vec::new());
    };

    let mut levels = Vec::with_capacity(raw.len());
    for entry in raw {
        let (price, size) = match entry {
            Value::Object(map) => (
                map.get("price").and_then(lenient_f64),
                map.get("size").and_then(lenient_f64),
            ),
            Value::Array(pair) if pair.len() >= 2 => {
                (lenient_f64(&pair[0]), lenient_f64(&pair[1]))
            }
            _ => bail!("book level must be an object or [price, size] pair"),
        };
        let (price, size) = match (price, size) {
            (Some(p), Some(s)) => (p, s),
            _ => bail!("book level has a missing or non-finite price/size"),
        };
        if !(0.0..=1.0).contains(&price) {
            bail!("book level price {price} outside [0, 1]");
        }
        if size < 0.0 {
            bail!("book level size {size} is negative");
        }
        // Zero-size levels are deletions; they just do not make the book.
        if size > 0.0 {
            levels.push(BookLevel::new(price, size));
        }
    }
    Ok(levels)
}

fn parse_book(json: &Value, now_ms: i64) -> Result<OrderbookSnapshot> {
    let market = market_id(json)?;
    let bids = parse_levels(json.get("bids")).context("bad bids")?;
    let asks = parse_levels(json.get("asks")).context("bad asks")?;
    if bids.is_empty() && asks.is_empty() {
        bail!("book frame carries no levels");
    }
    Ok(OrderbookSnapshot::new(timestamp_ms(json, now_ms), market, bids, asks))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 50 * 1024;
    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn parses_trade_with_string_price() {
        let frame = r#"{"type":"trade","market":"mkt-1","price":"0.52","size":10,"side":"buy","timestamp":1699999999000}"#;
        let parsed = parse_frame(frame, MAX, NOW).unwrap().unwrap();
        let StreamFrame::Trade(tick) = parsed else {
            panic!("expected trade");
        };
        assert_eq!(tick.market_id, "mkt-1");
        assert_eq!(tick.price, 0.52);
        assert_eq!(tick.side, Side::Buy);
        assert_eq!(tick.timestamp_ms, 1_699_999_999_000);
    }

    #[test]
    fn parses_book_with_array_levels() {
        let frame = r#"{"channel":"orderbook","asset_id":"mkt-2","bids":[["0.48","100"],["0.47","50"]],"asks":[{"price":0.52,"size":80}]}"#;
        let parsed = parse_frame(frame, MAX, NOW).unwrap().unwrap();
        let StreamFrame::Book(book) = parsed else {
            panic!("expected book");
        };
        assert_eq!(book.market_id, "mkt-2");
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.best_bid, 0.48);
        assert_eq!(book.best_ask, 0.52);
        // No timestamp in the frame: receive time is used.
        assert_eq!(book.timestamp_ms, NOW);
    }

    #[test]
    fn rejects_oversized_frames() {
        let huge = format!(
            r#"{{"type":"trade","market":"m","price":0.5,"size":1,"side":"buy","pad":"{}"}}"#,
            "x".repeat(MAX)
        );
        assert!(parse_frame(&huge, MAX, NOW).is_err());
    }

    #[test]
    fn rejects_non_finite_and_non_positive_numerics() {
        for bad in [
            r#"{"type":"trade","market":"m","price":"NaN","size":1,"side":"buy"}"#,
            r#"{"type":"trade","market":"m","price":0.5,"size":0,"side":"buy"}"#,
            r#"{"type":"trade","market":"m","price":-0.1,"size":1,"side":"buy"}"#,
            r#"{"type":"trade","market":"m","price":1.5,"size":1,"side":"buy"}"#,
        ] {
            assert!(parse_frame(bad, MAX, NOW).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn rejects_missing_fields() {
        for bad in [
            r#"{"type":"trade","price":0.5,"size":1,"side":"buy"}"#,
            r#"{"type":"trade","market":"m","size":1,"side":"buy"}"#,
            r#"{"type":"trade","market":"m","price":0.5,"size":1}"#,
            r#"{"type":"book","market":"m","bids":[],"asks":[]}"#,
        ] {
            assert!(parse_frame(bad, MAX, NOW).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn ignores_unknown_envelopes_and_pongs() {
        assert!(parse_frame("PONG", MAX, NOW).unwrap().is_none());
        assert!(parse_frame(r#"{"type":"heartbeat"}"#, MAX, NOW)
            .unwrap()
            .is_none());
    }

    #[test]
    fn surfaces_error_frames() {
        let parsed = parse_frame(r#"{"type":"error","message":"bad subscription"}"#, MAX, NOW)
            .unwrap()
            .unwrap();
        assert!(matches!(parsed, StreamFrame::Error(m) if m == "bad subscription"));
    }

    #[test]
    fn zero_size_levels_are_dropped() {
        let frame = r#"{"type":"book","market":"m","bids":[["0.48","0"],["0.47","10"]],"asks":[["0.52","5"]]}"#;
        let parsed = parse_frame(frame, MAX, NOW).unwrap().unwrap();
        let StreamFrame::Book(book) = parsed else {
            panic!("expected book");
        };
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.best_bid, 0.47);
    }
}
