// =============================================================================
// Connection Event Journal -- per-exchange lifecycle records
// =============================================================================
//
// Appends one JSON line per connect/disconnect/reconnect to
// `<base>/raw/<exchange>/_events/connections_<day>.jsonl`. The health
// reporter summarises today's file. Journal failures are logged and never
// interfere with the stream.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lake;

/// One lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    /// "connected", "disconnected", or "reconnecting".
    pub event: String,
    /// Backoff gap before the next attempt, seconds. Only on "reconnecting".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_seconds: Option<f64>,
}

pub struct ConnectionEventLog {
    base: PathBuf,
    exchange: String,
}

impl ConnectionEventLog {
    pub fn new(base: PathBuf, exchange: &str) -> Self {
        Self {
            base,
            exchange: exchange.to_string(),
        }
    }

    pub fn connected(&self) {
        self.append("connected", None);
    }

    pub fn disconnected(&self) {
        self.append("disconnected", None);
    }

    pub fn reconnecting(&self, gap_seconds: f64) {
        self.append("reconnecting", Some(gap_seconds));
    }

    fn append(&self, event: &str, gap_seconds: Option<f64>) {
        let record = ConnectionEvent {
            ts: Utc::now().to_rfc3339(),
            event: event.to_string(),
            gap_seconds,
        };

        if let Err(e) = self.try_append(&record) {
            warn!(exchange = %self.exchange, error = %e, "failed to journal connection event");
        }
    }

    fn try_append(&self, record: &ConnectionEvent) -> anyhow::Result<()> {
        let day = lake::day_str_from_ms(Utc::now().timestamp_millis());
        let path = lake::connection_events_path(&self.base, &self.exchange, &day);
        if let Some(parent) = path.parent() {
            lake::ensure_dir(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }
}
