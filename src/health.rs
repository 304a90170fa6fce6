// =============================================================================
// Health -- per-component status cells and the periodic health artefacts
// =============================================================================
//
// Each supervised component owns one small mutex-protected status cell; the
// reporter copies every cell, gathers on-disk counts for the current UTC
// day, and overwrites two artefacts: a JSON heartbeat and a Markdown
// summary. Counts tolerate the nothing-written-yet case and report zero.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::bus::{BusStats, EventBus};
use crate::collector::events::ConnectionEvent;
use crate::collector::latency::LatencySummary;
use crate::lake;
use crate::transformer::parquet_sink::count_rows_in_partition;

// ---------------------------------------------------------------------------
// Status cells
// ---------------------------------------------------------------------------

/// Lifecycle state of a supervised component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    #[default]
    Idle,
    Stopped,
    Error,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Running => "running",
            RunState::Idle => "idle",
            RunState::Stopped => "stopped",
            RunState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Status cell for one exchange collector.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CollectorStatus {
    pub state: RunState,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub disconnects: u64,
    pub latency: Option<LatencySummary>,
}

/// Status cell for the scheduled macro fetcher.
#[derive(Debug, Clone, Serialize, Default)]
pub struct FetcherStatus {
    pub state: RunState,
    pub last_run_start: Option<DateTime<Utc>>,
    pub last_run_end: Option<DateTime<Utc>>,
    pub last_run_rows: usize,
    /// Most recent error per key; cleared on that key's next success.
    pub last_errors: HashMap<String, String>,
}

/// Status cell for the bar transformer.
#[derive(Debug, Clone, Serialize, Default)]
pub struct TransformerStatus {
    pub state: RunState,
    pub last_run_start: Option<DateTime<Utc>>,
    pub last_run_end: Option<DateTime<Utc>>,
    pub last_run_rows: usize,
    pub last_error: Option<String>,
}

/// All status cells, shared between the orchestrator's tasks and the
/// reporter. Cells are individually locked so the reporter never contends
/// with a hot path for long.
pub struct StatusBoard {
    pub collectors: BTreeMap<String, Arc<Mutex<CollectorStatus>>>,
    pub macro_minute: Arc<Mutex<FetcherStatus>>,
    pub transformer: Arc<Mutex<TransformerStatus>>,
}

impl StatusBoard {
    pub fn new(exchanges: impl IntoIterator<Item = String>) -> Self {
        let collectors = exchanges
            .into_iter()
            .map(|name| (name, Arc::new(Mutex::new(CollectorStatus::default()))))
            .collect();
        Self {
            collectors,
            macro_minute: Arc::new(Mutex::new(FetcherStatus::default())),
            transformer: Arc::new(Mutex::new(TransformerStatus::default())),
        }
    }

    /// Force every cell to `stopped` for the final snapshot.
    pub fn mark_all_stopped(&self) {
        for cell in self.collectors.values() {
            cell.lock().state = RunState::Stopped;
        }
        self.macro_minute.lock().state = RunState::Stopped;
        self.transformer.lock().state = RunState::Stopped;
    }

    /// Top-level status: `error` dominates, then all-`stopped`, else
    /// `running`.
    pub fn overall(&self) -> RunState {
        let mut states: Vec<RunState> = self
            .collectors
            .values()
            .map(|c| c.lock().state)
            .collect();
        states.push(self.macro_minute.lock().state);
        states.push(self.transformer.lock().state);

        if states.iter().any(|s| *s == RunState::Error) {
            RunState::Error
        } else if states.iter().all(|s| *s == RunState::Stopped) {
            RunState::Stopped
        } else {
            RunState::Running
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk summaries
// ---------------------------------------------------------------------------

/// Counts for the current UTC day.
#[derive(Debug, Clone, Serialize, Default)]
pub struct FileStats {
    pub raw_files_today: usize,
    pub bar_rows_today: u64,
    pub macro_rows_today: u64,
}

/// Per-exchange connection gap summary for the current UTC day.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ConnectionSummary {
    pub disconnects: usize,
    pub reconnects: usize,
    pub total_gap_seconds: f64,
    pub last_event: String,
    pub last_event_ts: String,
}

/// Disk usage for the volume holding the lake.
#[derive(Debug, Clone, Serialize, Default)]
pub struct DiskStats {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub used_pct: f64,
    pub alert: String,
}

/// Count today's raw part files, bar rows, and macro rows. Every branch
/// tolerates "nothing there yet" and contributes zero.
pub fn summarize_files(base: &Path, today: NaiveDate) -> FileStats {
    let day = today.format("%Y-%m-%d").to_string();
    let mut stats = FileStats::default();

    // Raw journal files for today across all exchanges and symbols.
    if let Ok(exchanges) = std::fs::read_dir(base.join("raw")) {
        for exchange in exchanges.flatten() {
            let Ok(symbols) = std::fs::read_dir(exchange.path()) else {
                continue;
            };
            for symbol in symbols.flatten() {
                if symbol.file_name() == "_events" {
                    continue;
                }
                let day_dir = symbol.path().join(&day);
                let Ok(parts) = std::fs::read_dir(day_dir) else {
                    continue;
                };
                stats.raw_files_today += parts
                    .flatten()
                    .filter(|p| {
                        p.file_name()
                            .to_str()
                            .map(|n| n.starts_with("part_") && n.ends_with(".jsonl"))
                            .unwrap_or(false)
                    })
                    .count();
            }
        }
    }

    // Bar rows for today, from parquet footers.
    if let Ok(exchanges) = std::fs::read_dir(base.join("parquet")) {
        for exchange in exchanges.flatten() {
            let Ok(symbols) = std::fs::read_dir(exchange.path()) else {
                continue;
            };
            for symbol in symbols.flatten() {
                stats.bar_rows_today +=
                    count_rows_in_partition(&lake::partition_dir(&symbol.path(), today));
            }
        }
    }

    // Macro minute rows for today.
    if let Ok(keys) = std::fs::read_dir(base.join("macro").join("minute")) {
        for key in keys.flatten() {
            stats.macro_rows_today +=
                count_rows_in_partition(&lake::partition_dir(&key.path(), today));
        }
    }

    stats
}

/// Summarise today's connection event journals per exchange.
pub fn summarize_connections(base: &Path, today: NaiveDate) -> BTreeMap<String, ConnectionSummary> {
    let day = today.format("%Y-%m-%d").to_string();
    let mut out = BTreeMap::new();

    let Ok(exchanges) = std::fs::read_dir(base.join("raw")) else {
        return out;
    };

    for exchange in exchanges.flatten() {
        let Some(name) = exchange.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let path = lake::connection_events_path(base, &name, &day);
        let Ok(file) = std::fs::File::open(&path) else {
            continue;
        };

        let mut summary = ConnectionSummary::default();
        for line in std::io::BufReader::new(file).lines().map_while(|l| l.ok()) {
            let Ok(event) = serde_json::from_str::<ConnectionEvent>(&line) else {
                continue;
            };
            match event.event.as_str() {
                "disconnected" => summary.disconnects += 1,
                "reconnecting" => {
                    summary.reconnects += 1;
                    summary.total_gap_seconds += event.gap_seconds.unwrap_or(0.0);
                }
                _ => {}
            }
            summary.last_event = event.event;
            summary.last_event_ts = event.ts;
        }
        out.insert(name, summary);
    }

    out
}

/// Disk usage for the volume whose mount point is the deepest prefix of
/// `base`. Unknown volumes report zeros with an `unknown` alert.
pub fn disk_usage(base: &Path) -> DiskStats {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if base.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(d, _, _)| depth > d).unwrap_or(true) {
                best = Some((depth, disk.total_space(), disk.available_space()));
            }
        }
    }

    let Some((_, total, available)) = best else {
        return DiskStats {
            alert: "unknown".to_string(),
            ..DiskStats::default()
        };
    };

    let used = total.saturating_sub(available);
    let used_pct = if total > 0 {
        used as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let alert = if used_pct >= 95.0 {
        "critical"
    } else if used_pct >= 90.0 {
        "warning"
    } else if used_pct >= 80.0 {
        "caution"
    } else {
        "ok"
    };

    DiskStats {
        total_gb: total as f64 / 1e9,
        used_gb: used as f64 / 1e9,
        free_gb: available as f64 / 1e9,
        used_pct,
        alert: alert.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time status document. Rebuilt from the cells on every tick,
/// never kept as authoritative state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub ts_utc: String,
    pub status: RunState,
    pub uptime_secs: u64,
    pub collectors: BTreeMap<String, CollectorStatus>,
    pub macro_minute: FetcherStatus,
    pub transformer: TransformerStatus,
    pub files: FileStats,
    pub connections: BTreeMap<String, ConnectionSummary>,
    pub disk: DiskStats,
    pub bus: BusStats,
}

/// Assemble a snapshot: copy each cell under its lock, then read the disk
/// summaries without any lock held.
pub fn build_snapshot(
    base: &Path,
    board: &StatusBoard,
    bus: &EventBus,
    uptime: Duration,
) -> HealthSnapshot {
    let now = Utc::now();
    let today = now.date_naive();

    let collectors = board
        .collectors
        .iter()
        .map(|(name, cell)| (name.clone(), cell.lock().clone()))
        .collect();
    let macro_minute = board.macro_minute.lock().clone();
    let transformer = board.transformer.lock().clone();
    let status = board.overall();

    HealthSnapshot {
        ts_utc: now.to_rfc3339(),
        status,
        uptime_secs: uptime.as_secs(),
        collectors,
        macro_minute,
        transformer,
        files: summarize_files(base, today),
        connections: summarize_connections(base, today),
        disk: disk_usage(base),
        bus: bus.stats(),
    }
}

/// Overwrite the heartbeat JSON and the Markdown report.
pub fn write_artifacts(base: &Path, snapshot: &HealthSnapshot) -> Result<()> {
    let json_path = lake::heartbeat_path(base);
    let md_path = lake::health_report_path(base);

    for path in [&json_path, &md_path] {
        if let Some(parent) = path.parent() {
            lake::ensure_dir(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(snapshot).context("failed to serialise heartbeat")?;
    std::fs::write(&json_path, json)
        .with_context(|| format!("failed to write {}", json_path.display()))?;

    std::fs::write(&md_path, render_markdown(snapshot))
        .with_context(|| format!("failed to write {}", md_path.display()))?;

    debug!(json = %json_path.display(), md = %md_path.display(), "health artefacts written");
    Ok(())
}

fn fmt_ts(ts: &Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| "n/a".into())
}

/// Human-readable report in Markdown.
pub fn render_markdown(s: &HealthSnapshot) -> String {
    let mut md = String::new();

    md.push_str("# Tidelake Health Report\n\n");
    md.push_str(&format!("**Generated:** {}\n\n", s.ts_utc));
    md.push_str(&format!(
        "**Overall Status:** [{}]\n\n",
        s.status.to_string().to_uppercase()
    ));
    md.push_str(&format!("**Uptime:** {} s\n\n---\n\n", s.uptime_secs));

    md.push_str("## Collectors\n\n");
    md.push_str("| Exchange | Status | Last Seen | Disconnects | p50 | p95 | max | Last Error |\n");
    md.push_str("|----------|--------|-----------|-------------|-----|-----|-----|------------|\n");
    for (name, c) in &s.collectors {
        let (p50, p95, max) = c
            .latency
            .map(|l| {
                (
                    format!("{} ms", l.p50_ms),
                    format!("{} ms", l.p95_ms),
                    format!("{} ms", l.max_ms),
                )
            })
            .unwrap_or_else(|| ("-".into(), "-".into(), "-".into()));
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
            name,
            c.state,
            fmt_ts(&c.last_seen),
            c.disconnects,
            p50,
            p95,
            max,
            c.last_error.as_deref().unwrap_or("none"),
        ));
    }

    md.push_str("\n## Macro Minute Fetcher\n\n");
    md.push_str("| Metric | Value |\n|--------|-------|\n");
    md.push_str(&format!("| Status | {} |\n", s.macro_minute.state));
    md.push_str(&format!(
        "| Last Run Start | {} |\n",
        fmt_ts(&s.macro_minute.last_run_start)
    ));
    md.push_str(&format!(
        "| Last Run End | {} |\n",
        fmt_ts(&s.macro_minute.last_run_end)
    ));
    md.push_str(&format!(
        "| Last Run Rows | {} |\n",
        s.macro_minute.last_run_rows
    ));
    if s.macro_minute.last_errors.is_empty() {
        md.push_str("| Errors | none |\n");
    } else {
        let mut keys: Vec<_> = s.macro_minute.last_errors.iter().collect();
        keys.sort();
        for (key, err) in keys {
            md.push_str(&format!("| Error ({key}) | {err} |\n"));
        }
    }

    md.push_str("\n## Transformer\n\n");
    md.push_str("| Metric | Value |\n|--------|-------|\n");
    md.push_str(&format!("| Status | {} |\n", s.transformer.state));
    md.push_str(&format!(
        "| Last Run Start | {} |\n",
        fmt_ts(&s.transformer.last_run_start)
    ));
    md.push_str(&format!(
        "| Last Run End | {} |\n",
        fmt_ts(&s.transformer.last_run_end)
    ));
    md.push_str(&format!(
        "| Last Run Rows | {} |\n",
        s.transformer.last_run_rows
    ));
    md.push_str(&format!(
        "| Last Error | {} |\n",
        s.transformer.last_error.as_deref().unwrap_or("none")
    ));

    md.push_str("\n## Data Volume (Today)\n\n");
    md.push_str("| Metric | Count |\n|--------|-------|\n");
    md.push_str(&format!("| Raw JSONL Files | {} |\n", s.files.raw_files_today));
    md.push_str(&format!("| Bar Rows | {} |\n", s.files.bar_rows_today));
    md.push_str(&format!(
        "| Macro Minute Rows | {} |\n",
        s.files.macro_rows_today
    ));

    md.push_str("\n## Connection Gaps (Today)\n\n");
    if s.connections.is_empty() {
        md.push_str("No connection events recorded today.\n");
    } else {
        md.push_str("| Exchange | Disconnects | Reconnects | Total Gap | Last Event |\n");
        md.push_str("|----------|-------------|------------|-----------|------------|\n");
        for (name, c) in &s.connections {
            md.push_str(&format!(
                "| {} | {} | {} | {:.1} s | {} @ {} |\n",
                name, c.disconnects, c.reconnects, c.total_gap_seconds, c.last_event, c.last_event_ts,
            ));
        }
    }

    md.push_str("\n## Disk\n\n");
    md.push_str("| Metric | Value |\n|--------|-------|\n");
    md.push_str(&format!("| Status | [{}] |\n", s.disk.alert.to_uppercase()));
    md.push_str(&format!(
        "| Usage | {:.1}% ({:.1} GB / {:.1} GB) |\n",
        s.disk.used_pct, s.disk.used_gb, s.disk.total_gb
    ));
    md.push_str(&format!("| Free | {:.1} GB |\n", s.disk.free_gb));

    md.push_str("\n## Bus\n\n");
    md.push_str("| Metric | Value |\n|--------|-------|\n");
    md.push_str(&format!("| Published | {} |\n", s.bus.published));
    md.push_str(&format!("| Dropped | {} |\n", s.bus.dropped));
    md.push_str(&format!("| Subscribers | {} |\n", s.bus.subscribers));

    md
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::bars::BarRecord;
    use crate::transformer::parquet_sink;

    const T0: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

    fn board() -> StatusBoard {
        StatusBoard::new(["binance".to_string(), "kraken".to_string()])
    }

    #[test]
    fn overall_error_dominates() {
        let b = board();
        b.collectors["binance"].lock().state = RunState::Running;
        b.collectors["kraken"].lock().state = RunState::Error;
        assert_eq!(b.overall(), RunState::Error);
    }

    #[test]
    fn overall_stopped_only_when_everything_stopped() {
        let b = board();
        b.collectors["binance"].lock().state = RunState::Stopped;
        b.collectors["kraken"].lock().state = RunState::Stopped;
        b.macro_minute.lock().state = RunState::Stopped;
        assert_eq!(b.overall(), RunState::Running); // transformer still idle

        b.mark_all_stopped();
        assert_eq!(b.overall(), RunState::Stopped);
    }

    #[test]
    fn overall_running_by_default() {
        assert_eq!(board().overall(), RunState::Running);
    }

    #[test]
    fn empty_lake_summarises_to_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let stats = summarize_files(tmp.path(), lake::date_from_ms(T0));
        assert_eq!(stats.raw_files_today, 0);
        assert_eq!(stats.bar_rows_today, 0);
        assert_eq!(stats.macro_rows_today, 0);
    }

    #[test]
    fn file_counts_cover_raw_and_columnar_trees() {
        let tmp = tempfile::tempdir().unwrap();
        let today = lake::date_from_ms(T0);

        // Two raw part files plus a rogue non-part file.
        let day_dir = lake::raw_symbol_day_dir(tmp.path(), "binance", "BTCUSDT", "2025-01-01");
        std::fs::create_dir_all(&day_dir).unwrap();
        std::fs::write(day_dir.join("part_001.jsonl"), "{}\n").unwrap();
        std::fs::write(day_dir.join("part_002.jsonl"), "{}\n").unwrap();
        std::fs::write(day_dir.join("ignore.txt"), "x").unwrap();

        // Three bar rows for today.
        let bars: Vec<BarRecord> = (0..3)
            .map(|i| BarRecord {
                symbol: "BTCUSDT".into(),
                window_start_ms: T0 + i * 1000,
                open: Some(1.0),
                high: Some(1.0),
                low: Some(1.0),
                close: Some(1.0),
                volume_base: 1.0,
                volume_quote: 1.0,
                trade_count: 1,
                vwap: Some(1.0),
                bid: None,
                ask: None,
                spread: None,
            })
            .collect();
        parquet_sink::write_bars_partitioned(
            &lake::bars_symbol_root(tmp.path(), "binance", "BTCUSDT"),
            &bars,
            parquet_sink::compression_from_name("snappy"),
        )
        .unwrap();

        let stats = summarize_files(tmp.path(), today);
        assert_eq!(stats.raw_files_today, 2);
        assert_eq!(stats.bar_rows_today, 3);
        assert_eq!(stats.macro_rows_today, 0);
    }

    #[test]
    fn connection_summary_totals_gaps() {
        let tmp = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();
        let day = today.format("%Y-%m-%d").to_string();

        let path = lake::connection_events_path(tmp.path(), "binance", &day);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            concat!(
                "{\"ts\":\"2025-01-01T00:00:00Z\",\"event\":\"connected\"}\n",
                "{\"ts\":\"2025-01-01T01:00:00Z\",\"event\":\"disconnected\"}\n",
                "{\"ts\":\"2025-01-01T01:00:01Z\",\"event\":\"reconnecting\",\"gap_seconds\":10.0}\n",
                "{\"ts\":\"2025-01-01T01:02:00Z\",\"event\":\"reconnecting\",\"gap_seconds\":20.0}\n",
            ),
        )
        .unwrap();

        let summaries = summarize_connections(tmp.path(), today);
        let s = &summaries["binance"];
        assert_eq!(s.disconnects, 1);
        assert_eq!(s.reconnects, 2);
        assert!((s.total_gap_seconds - 30.0).abs() < 1e-9);
        assert_eq!(s.last_event, "reconnecting");
    }

    #[test]
    fn artefacts_are_written_and_parse_back() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new(10);
        let b = board();

        let snapshot = build_snapshot(tmp.path(), &b, &bus, Duration::from_secs(120));
        write_artifacts(tmp.path(), &snapshot).unwrap();

        let json = std::fs::read_to_string(lake::heartbeat_path(tmp.path())).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["status"], "running");
        assert_eq!(parsed["uptime_secs"], 120);
        assert!(parsed["collectors"]["binance"].is_object());

        let md = std::fs::read_to_string(lake::health_report_path(tmp.path())).unwrap();
        assert!(md.contains("# Tidelake Health Report"));
        assert!(md.contains("## Collectors"));
        assert!(md.contains("## Data Volume (Today)"));
        assert!(md.contains("[RUNNING]"));
    }

    #[test]
    fn markdown_reflects_component_states() {
        let b = board();
        b.collectors["binance"].lock().last_error = Some("boom".into());
        b.macro_minute
            .lock()
            .last_errors
            .insert("SPY".into(), "timeout".into());

        let bus = EventBus::new(10);
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = build_snapshot(tmp.path(), &b, &bus, Duration::from_secs(1));
        let md = render_markdown(&snapshot);
        assert!(md.contains("boom"));
        assert!(md.contains("Error (SPY) | timeout"));
    }

    #[test]
    fn disk_usage_reports_a_known_alert_level() {
        let stats = disk_usage(Path::new("/"));
        assert!(["ok", "caution", "warning", "critical", "unknown"]
            .contains(&stats.alert.as_str()));
    }
}
