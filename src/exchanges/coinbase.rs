// =============================================================================
// Coinbase Adapter -- subscribe-after-connect, ISO-8601 timestamps
// =============================================================================
//
// The feed URL is fixed; one subscribe message requests the `matches`
// (trades) and `ticker` (top-of-book) channels for every product. Timestamps
// arrive as ISO-8601 strings with a `Z` suffix.

use serde_json::{json, Value};
use tracing::debug;

use crate::types::{CanonicalEvent, Side, StreamKind};

use super::{iso_to_ms, value_as_f64, value_as_i64, ExchangeAdapter};

pub struct CoinbaseAdapter {
    wss_url: String,
    symbols: Vec<String>,
}

impl CoinbaseAdapter {
    pub fn new(wss_url: &str, symbols: &[String]) -> Self {
        Self {
            wss_url: wss_url.to_string(),
            symbols: symbols.to_vec(),
        }
    }
}

impl ExchangeAdapter for CoinbaseAdapter {
    fn exchange(&self) -> &str {
        "coinbase"
    }

    fn connect_url(&self) -> String {
        self.wss_url.clone()
    }

    fn subscribe_messages(&self) -> Vec<String> {
        let msg = json!({
            "type": "subscribe",
            "product_ids": self.symbols,
            "channels": ["ticker", "matches"],
        });
        vec![msg.to_string()]
    }

    fn decode(&self, text: &str, ts_recv: i64) -> Option<CanonicalEvent> {
        let root: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "coinbase frame is not JSON; skipping");
                return None;
            }
        };

        let msg_type = root.get("type").and_then(Value::as_str).unwrap_or("");

        match msg_type {
            // Acks, keepalives, and feed-level errors carry no market data.
            "subscriptions" | "heartbeat" | "error" => None,

            "match" | "last_match" => {
                let symbol = root
                    .get("product_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_uppercase();
                let ts_event = root
                    .get("time")
                    .map(|t| iso_to_ms(t, ts_recv))
                    .unwrap_or(ts_recv);

                let side = match root.get("side").and_then(Value::as_str) {
                    Some("buy") => Some(Side::Buy),
                    Some("sell") => Some(Side::Sell),
                    _ => None,
                };

                Some(CanonicalEvent {
                    exchange: self.exchange().to_string(),
                    symbol,
                    ts_event,
                    ts_recv,
                    stream: StreamKind::Trade,
                    price: root.get("price").and_then(value_as_f64),
                    qty: root.get("size").and_then(value_as_f64),
                    side,
                    bid: None,
                    ask: None,
                    trade_id: root.get("trade_id").and_then(value_as_i64),
                })
            }

            "ticker" => {
                let symbol = root
                    .get("product_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_uppercase();
                let ts_event = root
                    .get("time")
                    .map(|t| iso_to_ms(t, ts_recv))
                    .unwrap_or(ts_recv);

                Some(CanonicalEvent {
                    exchange: self.exchange().to_string(),
                    symbol,
                    ts_event,
                    ts_recv,
                    stream: StreamKind::BookTicker,
                    price: None,
                    qty: None,
                    side: None,
                    bid: root.get("best_bid").and_then(value_as_f64),
                    ask: root.get("best_ask").and_then(value_as_f64),
                    trade_id: None,
                })
            }

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> CoinbaseAdapter {
        CoinbaseAdapter::new(
            "wss://ws-feed.exchange.coinbase.com",
            &["BTC-USD".to_string(), "ETH-USD".to_string()],
        )
    }

    #[test]
    fn url_is_fixed_and_subscribe_names_both_channels() {
        let a = adapter();
        assert_eq!(a.connect_url(), "wss://ws-feed.exchange.coinbase.com");

        let msgs = a.subscribe_messages();
        assert_eq!(msgs.len(), 1);
        let parsed: Value = serde_json::from_str(&msgs[0]).unwrap();
        assert_eq!(parsed["type"], "subscribe");
        assert_eq!(parsed["product_ids"][0], "BTC-USD");
        assert_eq!(parsed["channels"][0], "ticker");
        assert_eq!(parsed["channels"][1], "matches");
    }

    #[test]
    fn decodes_match_with_iso_time() {
        let frame = r#"{
            "type": "match", "trade_id": 865, "side": "sell",
            "size": "0.5", "price": "95000.25",
            "product_id": "BTC-USD", "time": "2025-01-01T00:00:01.500Z"
        }"#;
        let ev = adapter().decode(frame, 1_735_689_602_000).unwrap();
        assert_eq!(ev.stream, StreamKind::Trade);
        assert_eq!(ev.symbol, "BTC-USD");
        assert_eq!(ev.ts_event, 1_735_689_601_500);
        assert_eq!(ev.price, Some(95_000.25));
        assert_eq!(ev.qty, Some(0.5));
        assert_eq!(ev.side, Some(Side::Sell));
        assert_eq!(ev.trade_id, Some(865));
    }

    #[test]
    fn decodes_ticker_as_book_ticker() {
        let frame = r#"{
            "type": "ticker", "product_id": "eth-usd",
            "best_bid": "3399.50", "best_ask": "3400.10",
            "time": "2025-01-01T00:00:02Z"
        }"#;
        let ev = adapter().decode(frame, 0).unwrap();
        assert_eq!(ev.stream, StreamKind::BookTicker);
        assert_eq!(ev.symbol, "ETH-USD");
        assert_eq!(ev.bid, Some(3399.50));
        assert_eq!(ev.ask, Some(3400.10));
    }

    #[test]
    fn missing_time_falls_back_to_receive_time() {
        let frame = r#"{ "type": "ticker", "product_id": "BTC-USD",
                         "best_bid": "1", "best_ask": "2" }"#;
        let ev = adapter().decode(frame, 777).unwrap();
        assert_eq!(ev.ts_event, 777);
        assert_eq!(ev.ts_recv, 777);
    }

    #[test]
    fn control_messages_are_skipped() {
        for frame in [
            r#"{ "type": "subscriptions", "channels": [] }"#,
            r#"{ "type": "heartbeat", "sequence": 1 }"#,
            r#"{ "type": "error", "message": "rate limited" }"#,
            r#"{ "type": "l2update" }"#,
        ] {
            assert!(adapter().decode(frame, 0).is_none(), "should skip {frame}");
        }
    }
}
