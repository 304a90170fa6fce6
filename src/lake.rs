// =============================================================================
// Lake Layout -- UTC clock helpers and on-disk directory structure
// =============================================================================
//
// Every path the lake touches is built here so that the writers, the
// transformer, the macro fetcher, and the health reporter all agree on the
// same tree:
//
//   <base>/raw/<exchange>/<SYMBOL>/<YYYY-MM-DD>/part_NNN.jsonl
//   <base>/raw/<exchange>/_events/connections_<YYYY-MM-DD>.jsonl
//   <base>/parquet/<exchange>/<SYMBOL>/year=Y/month=M/day=D/*.parquet
//   <base>/macro/minute/<KEY>/year=Y/month=M/day=D/*.parquet
//   <base>/logs/health/heartbeat.json
//   <base>/reports/health.md
//
// All time reasoning is UTC at integer-millisecond resolution.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// UTC calendar date for an epoch-millisecond timestamp.
pub fn date_from_ms(ts_ms: i64) -> NaiveDate {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
        .date_naive()
}

/// `YYYY-MM-DD` day string for an epoch-millisecond timestamp.
pub fn day_str_from_ms(ts_ms: i64) -> String {
    date_from_ms(ts_ms).format("%Y-%m-%d").to_string()
}

/// Start of the aggregation bucket containing `ts_ms`, in whole UTC seconds.
///
/// A timestamp exactly on a bucket boundary belongs to the bucket that starts
/// there, not the previous one.
pub fn bucket_start_sec(ts_ms: i64, interval_sec: i64) -> i64 {
    let sec = ts_ms.div_euclid(1000);
    sec.div_euclid(interval_sec) * interval_sec
}

/// Next rotation boundary past `now_sec`: the following multiple of
/// `interval_sec`.
pub fn next_rotation_boundary(now_sec: i64, interval_sec: i64) -> i64 {
    (now_sec.div_euclid(interval_sec) + 1) * interval_sec
}

/// Millisecond timestamp back to a timezone-aware UTC datetime.
pub fn utc_from_ms(ts_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

// ---------------------------------------------------------------------------
// Raw journal paths
// ---------------------------------------------------------------------------

/// Root of one exchange's raw journal: `<base>/raw/<exchange>`.
pub fn raw_exchange_dir(base: &Path, exchange: &str) -> PathBuf {
    base.join("raw").join(exchange)
}

/// Path component for a symbol. Pair-style symbols (`BTC/USD`) would split
/// into nested directories, so the separator is flattened.
pub fn symbol_component(symbol: &str) -> String {
    symbol.replace('/', "-")
}

/// Day directory for one symbol's raw files:
/// `<base>/raw/<exchange>/<SYMBOL>/<YYYY-MM-DD>`.
pub fn raw_symbol_day_dir(base: &Path, exchange: &str, symbol: &str, day: &str) -> PathBuf {
    raw_exchange_dir(base, exchange)
        .join(symbol_component(symbol))
        .join(day)
}

/// Connection lifecycle journal for one exchange and day.
pub fn connection_events_path(base: &Path, exchange: &str, day: &str) -> PathBuf {
    raw_exchange_dir(base, exchange)
        .join("_events")
        .join(format!("connections_{day}.jsonl"))
}

// ---------------------------------------------------------------------------
// Columnar output paths
// ---------------------------------------------------------------------------

/// Root of one symbol's bar partitions: `<base>/parquet/<exchange>/<SYMBOL>`.
pub fn bars_symbol_root(base: &Path, exchange: &str, symbol: &str) -> PathBuf {
    base.join("parquet")
        .join(exchange)
        .join(symbol_component(symbol))
}

/// Root of one macro key's minute partitions: `<base>/macro/minute/<KEY>`.
pub fn macro_key_root(base: &Path, key: &str) -> PathBuf {
    base.join("macro").join("minute").join(key)
}

/// Hive-style partition directory under `root` for a UTC date
/// (`year=Y/month=M/day=D`, components unpadded).
pub fn partition_dir(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(format!("year={}", date.year()))
        .join(format!("month={}", date.month()))
        .join(format!("day={}", date.day()))
}

// ---------------------------------------------------------------------------
// Health artefact paths
// ---------------------------------------------------------------------------

/// Machine-readable heartbeat, overwritten every reporting tick.
pub fn heartbeat_path(base: &Path) -> PathBuf {
    base.join("logs").join("health").join("heartbeat.json")
}

/// Human-readable health report, overwritten every reporting tick.
pub fn health_report_path(base: &Path) -> PathBuf {
    base.join("reports").join("health.md")
}

/// Create `path` and all missing parents.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_string_is_utc() {
        // 2025-01-01T00:00:00Z
        assert_eq!(day_str_from_ms(1_735_689_600_000), "2025-01-01");
        // One millisecond before midnight stays on the previous day.
        assert_eq!(day_str_from_ms(1_735_689_599_999), "2024-12-31");
    }

    #[test]
    fn bucket_boundary_belongs_to_its_own_bucket() {
        let t0 = 1_735_689_600_000; // exactly on a second boundary
        assert_eq!(bucket_start_sec(t0, 1), 1_735_689_600);
        assert_eq!(bucket_start_sec(t0 + 999, 1), 1_735_689_600);
        assert_eq!(bucket_start_sec(t0 + 1000, 1), 1_735_689_601);
    }

    #[test]
    fn bucket_respects_interval() {
        let t = 1_735_689_605_500; // :05.5
        assert_eq!(bucket_start_sec(t, 10), 1_735_689_600);
        assert_eq!(bucket_start_sec(t, 1), 1_735_689_605);
    }

    #[test]
    fn rotation_boundary_is_next_multiple() {
        assert_eq!(next_rotation_boundary(100, 60), 120);
        assert_eq!(next_rotation_boundary(120, 60), 180);
        assert_eq!(next_rotation_boundary(121, 60), 180);
    }

    #[test]
    fn partition_dir_is_unpadded() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        let dir = partition_dir(Path::new("/lake/parquet/binance/BTCUSDT"), date);
        assert_eq!(
            dir,
            PathBuf::from("/lake/parquet/binance/BTCUSDT/year=2025/month=1/day=7")
        );
    }

    #[test]
    fn raw_day_dir_layout() {
        let dir = raw_symbol_day_dir(Path::new("/lake"), "binance", "BTCUSDT", "2025-01-01");
        assert_eq!(dir, PathBuf::from("/lake/raw/binance/BTCUSDT/2025-01-01"));
    }

    #[test]
    fn pair_symbols_flatten_into_one_component() {
        let dir = raw_symbol_day_dir(Path::new("/lake"), "kraken", "BTC/USD", "2025-01-01");
        assert_eq!(dir, PathBuf::from("/lake/raw/kraken/BTC-USD/2025-01-01"));
    }
}
