// =============================================================================
// Macro Minute Fetcher -- scheduled polling of an external minute-bar source
// =============================================================================
//
// Polls a public chart HTTP endpoint for one-minute OHLCV per configured key,
// normalises rows to UTC, and appends them to a per-key partition tree.
// Before writing, the existing partitions for the lookback window are read
// and only rows with previously unseen timestamps are written, so a repeat
// run against identical upstream data writes nothing. One key's failure is
// recorded in its error slot and never blocks the other keys.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, StringArray, TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::health::{FetcherStatus, RunState};
use crate::lake;
use crate::shutdown::StopSignal;
use crate::transformer::parquet_sink::{compression_from_name, write_batch};

/// The upstream limits one-minute history to one week.
const MAX_LOOKBACK_DAYS: i64 = 7;

/// One normalised minute bar from the external source.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteBar {
    /// Bar start, milliseconds since the Unix epoch, UTC.
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub key: String,
}

// ---------------------------------------------------------------------------
// Fetch & decode
// ---------------------------------------------------------------------------

/// Fetch `lookback_days` of one-minute bars for `key`.
pub async fn fetch_minute_bars(
    client: &reqwest::Client,
    key: &str,
    lookback_days: i64,
) -> Result<Vec<MinuteBar>> {
    let days = lookback_days.clamp(1, MAX_LOOKBACK_DAYS);
    if days != lookback_days {
        warn!(key, requested = lookback_days, capped = days, "lookback capped by upstream limit");
    }

    let url = format!(
        "https://query1.finance.yahoo.com/v8/finance/chart/{key}?interval=1m&range={days}d"
    );

    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET minute bars for {key}"))?;

    let status = resp.status();
    let body: Value = resp
        .json()
        .await
        .context("failed to parse chart response body")?;

    if !status.is_success() {
        bail!("chart API returned {status} for {key}");
    }

    parse_chart_response(key, &body)
}

/// Decode the chart payload: parallel arrays of timestamps and OHLCV, with
/// nulls on halted minutes. Rows missing any price are dropped; a missing
/// volume is zero. This is the only function that knows the upstream shape.
pub fn parse_chart_response(key: &str, body: &Value) -> Result<Vec<MinuteBar>> {
    let result = body["chart"]["result"]
        .as_array()
        .and_then(|r| r.first())
        .context("chart response has no result")?;

    let Some(timestamps) = result["timestamp"].as_array() else {
        // A valid response with no rows in range.
        return Ok(Vec::new());
    };
    let series = &result["indicators"]["quote"][0];

    let field = |name: &str| series[name].as_array().cloned().unwrap_or_default();
    let opens = field("open");
    let highs = field("high");
    let lows = field("low");
    let closes = field("close");
    let volumes = field("volume");

    let mut by_ts: BTreeMap<i64, MinuteBar> = BTreeMap::new();
    for (i, ts) in timestamps.iter().enumerate() {
        let Some(ts_sec) = ts.as_i64() else { continue };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            opens.get(i).and_then(Value::as_f64),
            highs.get(i).and_then(Value::as_f64),
            lows.get(i).and_then(Value::as_f64),
            closes.get(i).and_then(Value::as_f64),
        ) else {
            continue;
        };
        let volume = volumes.get(i).and_then(Value::as_i64).unwrap_or(0);

        // Later occurrences of a timestamp win.
        by_ts.insert(
            ts_sec * 1000,
            MinuteBar {
                ts_ms: ts_sec * 1000,
                open,
                high,
                low,
                close,
                volume,
                key: key.to_string(),
            },
        );
    }

    Ok(by_ts.into_values().collect())
}

// ---------------------------------------------------------------------------
// Dedup & persistence
// ---------------------------------------------------------------------------

/// Timestamps already present in the key's partitions over the lookback
/// window (plus today). Unreadable files are skipped.
pub fn read_existing_ts(root: &Path, lookback_days: i64, today: NaiveDate) -> HashSet<i64> {
    let mut seen = HashSet::new();

    for days_back in 0..=lookback_days {
        let date = today - ChronoDuration::days(days_back);
        let dir = lake::partition_dir(root, date);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            let Ok(file) = std::fs::File::open(&path) else {
                continue;
            };
            let Ok(builder) = ParquetRecordBatchReaderBuilder::try_new(file) else {
                warn!(path = %path.display(), "unreadable parquet file; skipping");
                continue;
            };
            let Ok(reader) = builder.build() else { continue };
            for batch in reader.flatten() {
                if let Some(ts) = batch
                    .column_by_name("ts")
                    .and_then(|c| c.as_any().downcast_ref::<TimestampMillisecondArray>())
                {
                    for i in 0..ts.len() {
                        seen.insert(ts.value(i));
                    }
                }
            }
        }
    }
    seen
}

/// Keep the latest bar per timestamp, then drop every timestamp that already
/// exists on disk.
pub fn dedup_new_rows(fetched: Vec<MinuteBar>, existing: &HashSet<i64>) -> Vec<MinuteBar> {
    let mut latest: BTreeMap<i64, MinuteBar> = BTreeMap::new();
    for bar in fetched {
        latest.insert(bar.ts_ms, bar);
    }
    latest
        .into_values()
        .filter(|bar| !existing.contains(&bar.ts_ms))
        .collect()
}

fn minute_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(
            "ts",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Int64, false),
        Field::new("key", DataType::Utf8, false),
    ]))
}

fn bars_to_batch(rows: &[&MinuteBar]) -> Result<RecordBatch> {
    let ts: ArrayRef = Arc::new(
        TimestampMillisecondArray::from(rows.iter().map(|b| b.ts_ms).collect::<Vec<_>>())
            .with_timezone("UTC"),
    );
    let f64_col = |pick: fn(&MinuteBar) -> f64| -> ArrayRef {
        Arc::new(Float64Array::from(
            rows.iter().map(|b| pick(b)).collect::<Vec<_>>(),
        ))
    };
    let volume: ArrayRef = Arc::new(Int64Array::from(
        rows.iter().map(|b| b.volume).collect::<Vec<_>>(),
    ));
    let key: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|b| b.key.as_str()).collect::<Vec<_>>(),
    ));

    RecordBatch::try_new(
        minute_schema(),
        vec![
            ts,
            f64_col(|b| b.open),
            f64_col(|b| b.high),
            f64_col(|b| b.low),
            f64_col(|b| b.close),
            volume,
            key,
        ],
    )
    .context("failed to assemble minute batch")
}

/// Append `bars` under the key root, partitioned by UTC date. Returns rows
/// written.
pub fn write_minute_bars(root: &Path, bars: &[MinuteBar], compression: &str) -> Result<usize> {
    if bars.is_empty() {
        return Ok(0);
    }

    let codec = compression_from_name(compression);
    let mut by_day: BTreeMap<NaiveDate, Vec<&MinuteBar>> = BTreeMap::new();
    for bar in bars {
        by_day
            .entry(lake::date_from_ms(bar.ts_ms))
            .or_default()
            .push(bar);
    }

    let mut written = 0usize;
    for (date, rows) in by_day {
        let dir = lake::partition_dir(root, date);
        let batch = bars_to_batch(&rows)?;
        write_batch(&dir, &batch, codec)?;
        written += rows.len();
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// Scheduled run
// ---------------------------------------------------------------------------

/// Fetch every configured key once. Per-key failures land in that key's
/// error slot; the stop signal is honoured between keys.
pub async fn run_fetch(
    cfg: &Config,
    client: &reqwest::Client,
    status: &Arc<Mutex<FetcherStatus>>,
    lookback_days: i64,
    stop: &StopSignal,
) {
    let started = Utc::now();
    {
        let mut st = status.lock();
        st.state = RunState::Running;
        st.last_run_start = Some(started);
    }

    let base = cfg.base();
    let today = Utc::now().date_naive();
    let mut total_rows = 0usize;

    for key in &cfg.macro_minute.keys {
        if stop.is_set() {
            info!("stop requested; aborting macro fetch");
            break;
        }

        match fetch_minute_bars(client, key, lookback_days).await {
            Ok(fetched) if fetched.is_empty() => {
                warn!(key = %key, "no upstream data");
            }
            Ok(fetched) => {
                let root = lake::macro_key_root(&base, key);
                let existing = read_existing_ts(&root, lookback_days + 1, today);
                let fresh = dedup_new_rows(fetched, &existing);

                if fresh.is_empty() {
                    info!(key = %key, "no new rows after dedup");
                    status.lock().last_errors.remove(key);
                    continue;
                }

                match write_minute_bars(&root, &fresh, &cfg.transformer.parquet_compression) {
                    Ok(rows) => {
                        info!(key = %key, rows, "minute bars written");
                        total_rows += rows;
                        status.lock().last_errors.remove(key);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to write minute bars");
                        status.lock().last_errors.insert(key.clone(), e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "fetch failed");
                status.lock().last_errors.insert(key.clone(), e.to_string());
            }
        }
    }

    let finished = Utc::now();
    {
        let mut st = status.lock();
        st.state = RunState::Idle;
        st.last_run_end = Some(finished);
        st.last_run_rows = total_rows;
    }
    info!(
        rows = total_rows,
        elapsed_s = (finished - started).num_seconds(),
        "macro fetch complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

    fn bar(ts_ms: i64, close: f64) -> MinuteBar {
        MinuteBar {
            ts_ms,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000,
            key: "SPY".into(),
        }
    }

    #[test]
    fn chart_payload_decodes_and_drops_null_rows() {
        let body: Value = serde_json::from_str(
            r#"{
                "chart": {
                    "result": [{
                        "timestamp": [1735689600, 1735689660, 1735689720],
                        "indicators": { "quote": [{
                            "open":   [100.0, null, 102.0],
                            "high":   [101.0, null, 103.0],
                            "low":    [ 99.0, null, 101.0],
                            "close":  [100.5, null, 102.5],
                            "volume": [5000, null, null]
                        }]}
                    }],
                    "error": null
                }
            }"#,
        )
        .unwrap();

        let bars = parse_chart_response("SPY", &body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].ts_ms, 1_735_689_600_000);
        assert_eq!(bars[0].close, 100.5);
        assert_eq!(bars[0].volume, 5000);
        // Null volume is zero, not a dropped row.
        assert_eq!(bars[1].ts_ms, 1_735_689_720_000);
        assert_eq!(bars[1].volume, 0);
        assert_eq!(bars[1].key, "SPY");
    }

    #[test]
    fn chart_payload_without_rows_is_empty_not_error() {
        let body: Value =
            serde_json::from_str(r#"{ "chart": { "result": [{}], "error": null } }"#).unwrap();
        assert!(parse_chart_response("SPY", &body).unwrap().is_empty());

        let bad: Value = serde_json::from_str(r#"{ "chart": { "result": [], "error": null } }"#).unwrap();
        assert!(parse_chart_response("SPY", &bad).is_err());
    }

    #[test]
    fn dedup_keeps_latest_and_drops_known_timestamps() {
        let mut existing = HashSet::new();
        existing.insert(T0);

        let fetched = vec![
            bar(T0, 100.0),          // already on disk
            bar(T0 + 60_000, 101.0), // new
            bar(T0 + 60_000, 101.5), // same minute refreshed: latest wins
            bar(T0 + 120_000, 102.0),
        ];

        let fresh = dedup_new_rows(fetched, &existing);
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].ts_ms, T0 + 60_000);
        assert_eq!(fresh[0].close, 101.5);
        assert_eq!(fresh[1].ts_ms, T0 + 120_000);
    }

    #[test]
    fn written_timestamps_are_rediscovered() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("macro/minute/SPY");

        let bars = vec![bar(T0, 100.0), bar(T0 + 60_000, 101.0)];
        let written = write_minute_bars(&root, &bars, "snappy").unwrap();
        assert_eq!(written, 2);

        let today = lake::date_from_ms(T0);
        let seen = read_existing_ts(&root, 2, today);
        assert!(seen.contains(&T0));
        assert!(seen.contains(&(T0 + 60_000)));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn second_identical_run_writes_zero_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("macro/minute/SPY");
        let today = lake::date_from_ms(T0);

        let upstream = vec![bar(T0, 100.0), bar(T0 + 60_000, 101.0)];

        // First run: everything is new.
        let first = dedup_new_rows(upstream.clone(), &read_existing_ts(&root, 2, today));
        assert_eq!(first.len(), 2);
        write_minute_bars(&root, &first, "snappy").unwrap();

        // Second run against identical upstream data: nothing to write.
        let second = dedup_new_rows(upstream, &read_existing_ts(&root, 2, today));
        assert!(second.is_empty());
    }

    #[test]
    fn bars_spanning_midnight_split_partitions() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("macro/minute/SPY");

        let bars = vec![bar(T0 - 60_000, 99.0), bar(T0, 100.0)];
        write_minute_bars(&root, &bars, "snappy").unwrap();

        assert!(root.join("year=2024/month=12/day=31").is_dir());
        assert!(root.join("year=2025/month=1/day=1").is_dir());
    }
}
