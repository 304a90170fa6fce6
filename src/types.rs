// =============================================================================
// Canonical Event Model
// =============================================================================
//
// The normalised wire record every adapter decodes into. One event per line
// in the raw journal; the same value is fanned out on the bus. Events are
// immutable once constructed.

use serde::{Deserialize, Serialize};

/// Which upstream stream a canonical event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Trade,
    BookTicker,
}

impl StreamKind {
    /// Wire name, also the bus channel prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Trade => "trade",
            StreamKind::BookTicker => "book_ticker",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taker side of a trade. Feeds that report "is buyer maker" translate
/// buyer-maker to `Sell` (the taker sold into the bid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Normalised market-data event.
///
/// Invariants: for `Trade`, `price` and `qty` are present and positive; for
/// `BookTicker`, `bid` and `ask` are present. `ts_event == ts_recv` only when
/// the venue supplied no event time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Venue name, lower-case (matches the raw directory component).
    pub exchange: String,
    /// Instrument symbol, upper-cased on decode.
    pub symbol: String,
    /// Event time, milliseconds since the Unix epoch, UTC.
    pub ts_event: i64,
    /// Receive time, milliseconds since the Unix epoch, UTC.
    pub ts_recv: i64,
    #[serde(rename = "stream")]
    pub stream: StreamKind,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub trade_id: Option<i64>,
}

impl CanonicalEvent {
    /// Bus channel this event is published on, e.g. `trade:BTCUSDT`.
    pub fn channel(&self) -> String {
        format!("{}:{}", self.stream, self.symbol)
    }

    /// Wire latency sample for this event (receive minus event time).
    pub fn latency_ms(&self) -> i64 {
        self.ts_recv - self.ts_event
    }
}
