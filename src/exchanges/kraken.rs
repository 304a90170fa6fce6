// =============================================================================
// Kraken Adapter -- v2 API, one subscription per channel, batched payloads
// =============================================================================
//
// Kraken's v2 feed wants separate subscribe requests for the trade and
// ticker channels. Data frames batch updates in a `data` array; the decode
// contract yields a single event per frame, so the first entry wins (ticker
// frames only ever carry one).

use serde_json::{json, Value};
use tracing::debug;

use crate::types::{CanonicalEvent, Side, StreamKind};

use super::{iso_to_ms, value_as_f64, value_as_i64, ExchangeAdapter};

pub struct KrakenAdapter {
    wss_url: String,
    symbols: Vec<String>,
}

impl KrakenAdapter {
    pub fn new(wss_url: &str, symbols: &[String]) -> Self {
        Self {
            wss_url: wss_url.to_string(),
            symbols: symbols.to_vec(),
        }
    }
}

impl ExchangeAdapter for KrakenAdapter {
    fn exchange(&self) -> &str {
        "kraken"
    }

    fn connect_url(&self) -> String {
        self.wss_url.clone()
    }

    fn subscribe_messages(&self) -> Vec<String> {
        ["trade", "ticker"]
            .iter()
            .map(|channel| {
                json!({
                    "method": "subscribe",
                    "params": { "channel": channel, "symbol": self.symbols },
                })
                .to_string()
            })
            .collect()
    }

    fn decode(&self, text: &str, ts_recv: i64) -> Option<CanonicalEvent> {
        let root: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "kraken frame is not JSON; skipping");
                return None;
            }
        };

        let channel = root.get("channel").and_then(Value::as_str).unwrap_or("");

        // Status/heartbeat channels and subscribe acks (frames with a
        // "method" field) carry no market data.
        if channel == "status" || channel == "heartbeat" || root.get("method").is_some() {
            return None;
        }

        let first = root
            .get("data")
            .and_then(Value::as_array)
            .and_then(|d| d.first())?;

        match channel {
            "trade" => {
                let symbol = first
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_uppercase();
                let ts_event = first
                    .get("timestamp")
                    .map(|t| iso_to_ms(t, ts_recv))
                    .unwrap_or(ts_recv);

                let side = match first.get("side").and_then(Value::as_str) {
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
                    price: first.get("price").and_then(value_as_f64),
                    qty: first.get("qty").and_then(value_as_f64),
                    side,
                    bid: None,
                    ask: None,
                    trade_id: first.get("trade_id").and_then(value_as_i64),
                })
            }

            "ticker" => {
                let symbol = first
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_uppercase();

                Some(CanonicalEvent {
                    exchange: self.exchange().to_string(),
                    symbol,
                    // Ticker frames carry no event time.
                    ts_event: ts_recv,
                    ts_recv,
                    stream: StreamKind::BookTicker,
                    price: None,
                    qty: None,
                    side: None,
                    bid: first.get("bid").and_then(value_as_f64),
                    ask: first.get("ask").and_then(value_as_f64),
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

    fn adapter() -> KrakenAdapter {
        KrakenAdapter::new("wss://ws.kraken.com/v2", &["BTC/USD".to_string()])
    }

    #[test]
    fn subscribes_trade_then_ticker_in_order() {
        let msgs = adapter().subscribe_messages();
        assert_eq!(msgs.len(), 2);

        let first: Value = serde_json::from_str(&msgs[0]).unwrap();
        let second: Value = serde_json::from_str(&msgs[1]).unwrap();
        assert_eq!(first["method"], "subscribe");
        assert_eq!(first["params"]["channel"], "trade");
        assert_eq!(second["params"]["channel"], "ticker");
        assert_eq!(first["params"]["symbol"][0], "BTC/USD");
    }

    #[test]
    fn decodes_batched_trade_taking_first_entry() {
        let frame = r#"{
            "channel": "trade", "type": "update",
            "data": [
                { "symbol": "BTC/USD", "side": "buy", "price": 95000.1, "qty": 0.2,
                  "ord_type": "market", "trade_id": 1001,
                  "timestamp": "2025-01-01T00:00:01.000Z" },
                { "symbol": "BTC/USD", "side": "sell", "price": 95000.0, "qty": 0.1,
                  "ord_type": "limit", "trade_id": 1002,
                  "timestamp": "2025-01-01T00:00:01.050Z" }
            ]
        }"#;
        let ev = adapter().decode(frame, 1_735_689_601_200).unwrap();
        assert_eq!(ev.stream, StreamKind::Trade);
        assert_eq!(ev.symbol, "BTC/USD");
        assert_eq!(ev.ts_event, 1_735_689_601_000);
        assert_eq!(ev.price, Some(95_000.1));
        assert_eq!(ev.qty, Some(0.2));
        assert_eq!(ev.side, Some(Side::Buy));
        assert_eq!(ev.trade_id, Some(1001));
    }

    #[test]
    fn ticker_is_stamped_with_receive_time() {
        let frame = r#"{
            "channel": "ticker", "type": "snapshot",
            "data": [ { "symbol": "BTC/USD", "bid": 94999.5, "ask": 95000.5,
                        "last": 95000.0, "volume": 12.5 } ]
        }"#;
        let ev = adapter().decode(frame, 424_242).unwrap();
        assert_eq!(ev.stream, StreamKind::BookTicker);
        assert_eq!(ev.bid, Some(94_999.5));
        assert_eq!(ev.ask, Some(95_000.5));
        // No venue timestamp: event time equals receive time.
        assert_eq!(ev.ts_event, 424_242);
    }

    #[test]
    fn control_frames_are_skipped() {
        for frame in [
            r#"{ "channel": "status", "data": [{ "system": "online" }] }"#,
            r#"{ "channel": "heartbeat" }"#,
            r#"{ "method": "subscribe", "result": { "channel": "trade" }, "success": true }"#,
            r#"{ "channel": "trade", "data": [] }"#,
        ] {
            assert!(adapter().decode(frame, 0).is_none(), "should skip {frame}");
        }
    }
}
