// =============================================================================
// Bar Aggregation -- raw events to gap-filled one-second OHLCV+quote bars
// =============================================================================
//
// Pure transformation: a day of canonical events in, a contiguous run of
// second-aligned bars out. Trades drive OHLCV and vwap; book tickers drive
// bid/ask/spread. Seconds with no trades repeat the previous close with zero
// volume; quotes forward-fill independently. Rows before the first trade of
// the range have no price to repeat, so their OHLC stays empty.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, warn};

use crate::lake;
use crate::types::{CanonicalEvent, StreamKind};

/// One aggregated bar. `window_start_ms` is second-aligned UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct BarRecord {
    pub symbol: String,
    pub window_start_ms: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume_base: f64,
    pub volume_quote: f64,
    pub trade_count: u64,
    pub vwap: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub spread: Option<f64>,
}

// ---------------------------------------------------------------------------
// Raw loading
// ---------------------------------------------------------------------------

/// Read every `part_*.jsonl` under `day_dir` in lexicographic filename
/// order. Unparsable lines (including a truncated final line from a crash)
/// are skipped and counted, never fatal. A missing directory is an empty
/// day.
pub fn load_raw_events(day_dir: &Path) -> Vec<CanonicalEvent> {
    let Ok(entries) = std::fs::read_dir(day_dir) else {
        return Vec::new();
    };

    let mut files: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("part_") && n.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut events = Vec::new();
    let mut skipped = 0usize;

    for path in &files {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open raw file");
                continue;
            }
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else {
                skipped += 1;
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CanonicalEvent>(&line) {
                Ok(ev) => events.push(ev),
                Err(_) => skipped += 1,
            }
        }
    }

    if skipped > 0 {
        debug!(dir = %day_dir.display(), skipped, "skipped unparsable raw lines");
    }
    events
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

struct TradeAgg {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume_base: f64,
    volume_quote: f64,
    count: u64,
}

struct QuoteAgg {
    bid: Option<f64>,
    ask: Option<f64>,
}

/// Aggregate one symbol's events into bars of `interval_sec` buckets.
///
/// The bars cover every bucket from the earliest to the latest observed
/// event, inclusive, with no gaps and no duplicates. Deterministic for a
/// given input set regardless of input order (events are stably sorted by
/// event time first).
pub fn aggregate_bars(
    events: &[CanonicalEvent],
    symbol: &str,
    interval_sec: i64,
) -> Vec<BarRecord> {
    if events.is_empty() {
        return Vec::new();
    }

    let mut ordered: Vec<&CanonicalEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.ts_event);

    let mut trades: BTreeMap<i64, TradeAgg> = BTreeMap::new();
    let mut quotes: BTreeMap<i64, QuoteAgg> = BTreeMap::new();

    for event in ordered {
        let bucket = lake::bucket_start_sec(event.ts_event, interval_sec);
        match event.stream {
            StreamKind::Trade => {
                let (Some(price), Some(qty)) = (event.price, event.qty) else {
                    continue;
                };
                let quote_volume = price * qty;
                trades
                    .entry(bucket)
                    .and_modify(|agg| {
                        agg.high = agg.high.max(price);
                        agg.low = agg.low.min(price);
                        agg.close = price;
                        agg.volume_base += qty;
                        agg.volume_quote += quote_volume;
                        agg.count += 1;
                    })
                    .or_insert(TradeAgg {
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                        volume_base: qty,
                        volume_quote: quote_volume,
                        count: 1,
                    });
            }
            StreamKind::BookTicker => {
                let agg = quotes.entry(bucket).or_insert(QuoteAgg {
                    bid: None,
                    ask: None,
                });
                if event.bid.is_some() {
                    agg.bid = event.bid;
                }
                if event.ask.is_some() {
                    agg.ask = event.ask;
                }
            }
        }
    }

    let t_min = match (trades.keys().next(), quotes.keys().next()) {
        (Some(&t), Some(&q)) => t.min(q),
        (Some(&t), None) => t,
        (None, Some(&q)) => q,
        (None, None) => return Vec::new(),
    };
    let t_max = trades
        .keys()
        .next_back()
        .copied()
        .unwrap_or(i64::MIN)
        .max(quotes.keys().next_back().copied().unwrap_or(i64::MIN));

    let mut bars = Vec::with_capacity(((t_max - t_min) / interval_sec + 1) as usize);
    let mut prev_close: Option<f64> = None;
    let mut prev_bid: Option<f64> = None;
    let mut prev_ask: Option<f64> = None;

    let mut bucket = t_min;
    while bucket <= t_max {
        let (open, high, low, close, volume_base, volume_quote, trade_count, vwap) =
            match trades.get(&bucket) {
                Some(agg) => {
                    let vwap = if agg.volume_base > 0.0 {
                        agg.volume_quote / agg.volume_base
                    } else {
                        agg.close
                    };
                    (
                        Some(agg.open),
                        Some(agg.high),
                        Some(agg.low),
                        Some(agg.close),
                        agg.volume_base,
                        agg.volume_quote,
                        agg.count,
                        Some(vwap),
                    )
                }
                // Tradeless second: repeat the previous close with zero
                // volume. With no prior close, OHLC stays empty.
                None => (
                    prev_close, prev_close, prev_close, prev_close, 0.0, 0.0, 0, prev_close,
                ),
            };
        prev_close = close.or(prev_close);

        if let Some(quote) = quotes.get(&bucket) {
            prev_bid = quote.bid.or(prev_bid);
            prev_ask = quote.ask.or(prev_ask);
        }
        let (bid, ask) = (prev_bid, prev_ask);
        let spread = match (bid, ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        };

        bars.push(BarRecord {
            symbol: symbol.to_string(),
            window_start_ms: bucket * 1000,
            open,
            high,
            low,
            close,
            volume_base,
            volume_quote,
            trade_count,
            vwap,
            bid,
            ask,
            spread,
        });

        bucket += interval_sec;
    }

    bars
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
