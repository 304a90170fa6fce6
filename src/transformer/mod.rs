// =============================================================================
// Transformer -- daily raw-to-bars runs across every configured symbol
// =============================================================================
//
// Reads one day of raw journal files per symbol and writes gap-filled
// one-second bars to the parquet tree. A failure on one symbol never stops
// the others; the run's outcome lands in the transformer status cell.

pub mod bars;
pub mod parquet_sink;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::health::{RunState, TransformerStatus};
use crate::lake;

use bars::aggregate_bars;
use parquet_sink::{compression_from_name, write_bars_partitioned};

/// Transform one symbol-day from raw JSONL to partitioned bars.
///
/// Returns rows written; an empty raw day writes nothing and is not an
/// error.
pub fn transform_symbol_day(
    base: &Path,
    exchange: &str,
    symbol: &str,
    date: NaiveDate,
    interval_sec: i64,
    compression: &str,
) -> Result<usize> {
    let day = date.format("%Y-%m-%d").to_string();
    let raw_dir = lake::raw_symbol_day_dir(base, exchange, symbol, &day);

    let events = bars::load_raw_events(&raw_dir);
    if events.is_empty() {
        warn!(exchange, symbol, day = %day, "no raw events to transform");
        return Ok(0);
    }

    let records = aggregate_bars(&events, &symbol.to_uppercase(), interval_sec);
    if records.is_empty() {
        warn!(exchange, symbol, day = %day, "no bars produced");
        return Ok(0);
    }

    let root = lake::bars_symbol_root(base, exchange, symbol);
    let rows = write_bars_partitioned(&root, &records, compression_from_name(compression))?;

    info!(
        exchange,
        symbol,
        day = %day,
        events = events.len(),
        rows,
        "bars written"
    );
    Ok(rows)
}

/// Run the transformer for `date` across every configured exchange and
/// symbol, recording the outcome in `status`.
pub fn run_for_date(cfg: &Config, date: NaiveDate, status: &Arc<Mutex<TransformerStatus>>) {
    let started = Utc::now();
    {
        let mut st = status.lock();
        st.state = RunState::Running;
        st.last_run_start = Some(started);
        st.last_error = None;
    }

    let base = cfg.base();
    let interval = cfg.transformer.resample_interval_sec;
    let compression = &cfg.transformer.parquet_compression;

    let mut total_rows = 0usize;
    let mut last_error: Option<String> = None;

    for ex in &cfg.exchanges {
        let exchange = ex.name.to_lowercase();
        for symbol in &ex.symbols {
            match transform_symbol_day(&base, &exchange, symbol, date, interval, compression) {
                Ok(rows) => total_rows += rows,
                Err(e) => {
                    error!(
                        exchange = %exchange,
                        symbol = %symbol,
                        error = %e,
                        "transform failed for symbol; continuing"
                    );
                    last_error = Some(format!("{exchange}/{symbol}: {e}"));
                }
            }
        }
    }

    let finished = Utc::now();
    {
        let mut st = status.lock();
        st.state = RunState::Idle;
        st.last_run_end = Some(finished);
        st.last_run_rows = total_rows;
        st.last_error = last_error;
    }

    info!(
        rows = total_rows,
        elapsed_s = (finished - started).num_seconds(),
        "transformer run complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanonicalEvent, Side, StreamKind};
    use arrow::array::{Array, Float64Array, TimestampMillisecondArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::collections::BTreeMap;

    const T0: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

    fn trade(ts: i64, price: f64, qty: f64) -> CanonicalEvent {
        CanonicalEvent {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            ts_event: ts,
            ts_recv: ts + 10,
            stream: StreamKind::Trade,
            price: Some(price),
            qty: Some(qty),
            side: Some(Side::Buy),
            bid: None,
            ask: None,
            trade_id: None,
        }
    }

    fn seed_raw_day(base: &Path, events: &[CanonicalEvent]) {
        let dir = lake::raw_symbol_day_dir(base, "binance", "BTCUSDT", "2025-01-01");
        std::fs::create_dir_all(&dir).unwrap();
        let lines: String = events
            .iter()
            .map(|e| serde_json::to_string(e).unwrap() + "\n")
            .collect();
        std::fs::write(dir.join("part_001.jsonl"), lines).unwrap();
    }

    /// Deduplicated view of a symbol's partition dir: window_start -> close.
    fn dedup_by_window(dir: &Path) -> BTreeMap<i64, Option<f64>> {
        let mut out = BTreeMap::new();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("parquet"))
            .collect();
        paths.sort();

        for path in paths {
            let reader =
                ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(path).unwrap())
                    .unwrap()
                    .build()
                    .unwrap();
            for batch in reader {
                let batch = batch.unwrap();
                let windows = batch
                    .column_by_name("window_start")
                    .unwrap()
                    .as_any()
                    .downcast_ref::<TimestampMillisecondArray>()
                    .unwrap();
                let closes = batch
                    .column_by_name("close")
                    .unwrap()
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .unwrap();
                for i in 0..batch.num_rows() {
                    let close = (!closes.is_null(i)).then(|| closes.value(i));
                    // Later files win, matching reader dedup discipline.
                    out.insert(windows.value(i), close);
                }
            }
        }
        out
    }

    #[test]
    fn raw_day_transforms_into_partitioned_bars() {
        let tmp = tempfile::tempdir().unwrap();
        seed_raw_day(
            tmp.path(),
            &[trade(T0, 100.0, 1.0), trade(T0 + 2500, 102.0, 2.0)],
        );

        let rows = transform_symbol_day(
            tmp.path(),
            "binance",
            "BTCUSDT",
            lake::date_from_ms(T0),
            1,
            "snappy",
        )
        .unwrap();
        // Seconds 0, 1, 2 inclusive.
        assert_eq!(rows, 3);

        let dir = lake::partition_dir(
            &lake::bars_symbol_root(tmp.path(), "binance", "BTCUSDT"),
            lake::date_from_ms(T0),
        );
        let view = dedup_by_window(&dir);
        assert_eq!(view.len(), 3);
        assert_eq!(view[&T0], Some(100.0));
        assert_eq!(view[&(T0 + 1000)], Some(100.0)); // gap-filled
        assert_eq!(view[&(T0 + 2000)], Some(102.0));
    }

    #[test]
    fn rerun_dedup_equals_single_run() {
        let tmp = tempfile::tempdir().unwrap();
        seed_raw_day(
            tmp.path(),
            &[trade(T0, 100.0, 1.0), trade(T0 + 1000, 101.0, 1.0)],
        );

        let date = lake::date_from_ms(T0);
        transform_symbol_day(tmp.path(), "binance", "BTCUSDT", date, 1, "snappy").unwrap();
        let dir = lake::partition_dir(
            &lake::bars_symbol_root(tmp.path(), "binance", "BTCUSDT"),
            date,
        );
        let single = dedup_by_window(&dir);

        transform_symbol_day(tmp.path(), "binance", "BTCUSDT", date, 1, "snappy").unwrap();
        let double = dedup_by_window(&dir);

        assert_eq!(single, double);
    }

    #[test]
    fn empty_day_writes_no_files_and_no_error() {
        let tmp = tempfile::tempdir().unwrap();
        let rows = transform_symbol_day(
            tmp.path(),
            "binance",
            "BTCUSDT",
            lake::date_from_ms(T0),
            1,
            "snappy",
        )
        .unwrap();
        assert_eq!(rows, 0);
        assert!(!lake::bars_symbol_root(tmp.path(), "binance", "BTCUSDT").exists());
    }

    #[test]
    fn run_for_date_updates_status_and_survives_bad_symbols() {
        let tmp = tempfile::tempdir().unwrap();
        seed_raw_day(tmp.path(), &[trade(T0, 100.0, 1.0)]);

        let cfg: Config = serde_json::from_str(&format!(
            r#"{{
                "base_path": "{}",
                "exchanges": [
                    {{ "name": "binance", "symbols": ["BTCUSDT", "NODATA"] }}
                ]
            }}"#,
            tmp.path().display()
        ))
        .unwrap();

        let status = Arc::new(Mutex::new(TransformerStatus::default()));
        run_for_date(&cfg, lake::date_from_ms(T0), &status);

        let st = status.lock();
        assert_eq!(st.state, RunState::Idle);
        assert_eq!(st.last_run_rows, 1);
        assert!(st.last_run_start.is_some());
        assert!(st.last_run_end.is_some());
        // NODATA is an empty day, not an error.
        assert!(st.last_error.is_none());
    }
}
