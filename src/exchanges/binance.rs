// =============================================================================
// Binance Adapter -- combined-stream decoding (trade + bookTicker)
// =============================================================================
//
// Subscriptions ride on the URL, so no subscribe messages are sent after the
// handshake. Frames arrive either in the combined-stream envelope
// `{"stream": "...", "data": {...}}` or, on single-stream endpoints, as the
// bare payload.

use serde_json::Value;
use tracing::debug;

use crate::types::{CanonicalEvent, Side, StreamKind};

use super::{value_as_f64, value_as_i64, ExchangeAdapter};

pub struct BinanceAdapter {
    wss_url: String,
    symbols: Vec<String>,
}

impl BinanceAdapter {
    pub fn new(wss_url: &str, symbols: &[String]) -> Self {
        Self {
            wss_url: wss_url.to_string(),
            symbols: symbols.to_vec(),
        }
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> &str {
        "binance"
    }

    /// Combined-stream URL with one trade and one bookTicker topic per
    /// symbol, e.g.
    /// `wss://stream.binance.com:9443/stream?streams=btcusdt@trade/btcusdt@bookTicker`.
    fn connect_url(&self) -> String {
        let base = self.wss_url.replace("/ws", "/stream?streams=");
        let base = base.trim_end_matches('/');

        let mut topics: Vec<String> = Vec::with_capacity(self.symbols.len() * 2);
        for s in &self.symbols {
            let lower = s.to_lowercase();
            topics.push(format!("{lower}@trade"));
            topics.push(format!("{lower}@bookTicker"));
        }
        format!("{base}{}", topics.join("/"))
    }

    fn subscribe_messages(&self) -> Vec<String> {
        Vec::new()
    }

    fn decode(&self, text: &str, ts_recv: i64) -> Option<CanonicalEvent> {
        let root: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "binance frame is not JSON; skipping");
                return None;
            }
        };

        // Combined-stream envelope carries the payload under "data".
        let stream_name = root.get("stream").and_then(Value::as_str);
        let data = root.get("data").unwrap_or(&root);

        let kind = match stream_name {
            Some(name) if name.contains("@trade") => StreamKind::Trade,
            Some(name) if name.contains("@bookTicker") => StreamKind::BookTicker,
            _ => {
                let etype = data.get("e").and_then(Value::as_str).unwrap_or("");
                if etype.eq_ignore_ascii_case("trade") {
                    StreamKind::Trade
                } else if etype.eq_ignore_ascii_case("bookticker") {
                    StreamKind::BookTicker
                } else {
                    // Subscription acks and anything unrecognised.
                    return None;
                }
            }
        };

        let symbol = data
            .get("s")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_uppercase();

        // Event time "E" is preferred, trade time "T" next, receive time last.
        let ts_event = data
            .get("E")
            .and_then(value_as_i64)
            .or_else(|| data.get("T").and_then(value_as_i64))
            .unwrap_or(ts_recv);

        let mut event = CanonicalEvent {
            exchange: self.exchange().to_string(),
            symbol,
            ts_event,
            ts_recv,
            stream: kind,
            price: None,
            qty: None,
            side: None,
            bid: None,
            ask: None,
            trade_id: None,
        };

        match kind {
            StreamKind::Trade => {
                event.price = data.get("p").and_then(value_as_f64);
                event.qty = data.get("q").and_then(value_as_f64);
                event.trade_id = data.get("t").and_then(value_as_i64);
                // Buyer-maker means the taker sold.
                let maker = data.get("m").and_then(Value::as_bool).unwrap_or(false);
                event.side = Some(if maker { Side::Sell } else { Side::Buy });
            }
            StreamKind::BookTicker => {
                event.bid = data.get("b").and_then(value_as_f64);
                event.ask = data.get("a").and_then(value_as_f64);
            }
        }

        Some(event)
    }
}
