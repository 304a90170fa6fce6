// =============================================================================
// Exchange Adapters -- venue-specific decoding behind one uniform trait
// =============================================================================
//
// An adapter is stateless: it knows how to build the connect URL, which
// subscribe messages (if any) to send after the handshake, and how to turn
// one inbound frame into at most one canonical event. Heartbeats, acks, and
// unknown message types decode to None, never to an error.

mod binance;
mod coinbase;
mod kraken;

pub use binance::BinanceAdapter;
pub use coinbase::CoinbaseAdapter;
pub use kraken::KrakenAdapter;

use anyhow::{bail, Result};
use chrono::DateTime;
use serde_json::Value;

use crate::config::ExchangeConfig;
use crate::types::CanonicalEvent;

/// Venue capability set: URL construction, post-connect subscriptions, and
/// frame decoding.
pub trait ExchangeAdapter: Send + Sync {
    /// Venue name as it appears in paths and logs.
    fn exchange(&self) -> &str;

    /// Absolute wss URL carrying any URL-based subscriptions.
    fn connect_url(&self) -> String;

    /// Ordered subscription requests to send after connect. Empty when the
    /// URL already carries the subscriptions.
    fn subscribe_messages(&self) -> Vec<String>;

    /// Decode one inbound text frame. `ts_recv` is the receive timestamp in
    /// epoch milliseconds and doubles as the event time when the venue
    /// supplies none.
    fn decode(&self, text: &str, ts_recv: i64) -> Option<CanonicalEvent>;
}

/// Build the adapter for a configured exchange. Unknown names are a startup
/// error.
pub fn adapter_for(cfg: &ExchangeConfig) -> Result<Box<dyn ExchangeAdapter>> {
    match cfg.name.to_lowercase().as_str() {
        "binance" => Ok(Box::new(BinanceAdapter::new(&cfg.wss_url, &cfg.symbols))),
        "coinbase" => Ok(Box::new(CoinbaseAdapter::new(&cfg.wss_url, &cfg.symbols))),
        "kraken" => Ok(Box::new(KrakenAdapter::new(&cfg.wss_url, &cfg.symbols))),
        other => bail!("unknown exchange adapter: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Shared decode helpers
// ---------------------------------------------------------------------------

/// Venues send numbers either as JSON numbers or as decimal strings.
pub(crate) fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub(crate) fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Parse an ISO-8601 timestamp (with `Z` or offset) into epoch milliseconds,
/// falling back to `fallback` when the field is absent or malformed.
pub(crate) fn iso_to_ms(value: &Value, fallback: i64) -> i64 {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(name: &str) -> ExchangeConfig {
        ExchangeConfig {
            name: name.to_string(),
            wss_url: "wss://example.test/ws".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
        }
    }

    #[test]
    fn factory_knows_all_venues() {
        for name in ["binance", "coinbase", "kraken", "Binance", "KRAKEN"] {
            assert!(adapter_for(&exchange(name)).is_ok(), "adapter for {name}");
        }
    }

    #[test]
    fn factory_rejects_unknown_venue() {
        let err = adapter_for(&exchange("bitfake")).err().unwrap();
        assert!(err.to_string().contains("unknown exchange adapter"));
    }

    #[test]
    fn numbers_parse_from_strings_and_numbers() {
        assert_eq!(value_as_f64(&serde_json::json!("1.25")), Some(1.25));
        assert_eq!(value_as_f64(&serde_json::json!(1.25)), Some(1.25));
        assert_eq!(value_as_f64(&serde_json::json!(null)), None);
        assert_eq!(value_as_i64(&serde_json::json!("42")), Some(42));
        assert_eq!(value_as_i64(&serde_json::json!(42)), Some(42));
    }

    #[test]
    fn iso_timestamps_normalise_to_ms() {
        let v = serde_json::json!("2025-01-01T00:00:01.500Z");
        assert_eq!(iso_to_ms(&v, 0), 1_735_689_601_500);
        // Absent or malformed falls back to receive time.
        assert_eq!(iso_to_ms(&serde_json::json!(null), 99), 99);
        assert_eq!(iso_to_ms(&serde_json::json!("not-a-time"), 99), 99);
    }
}
