// =============================================================================
// Configuration -- lake settings loaded from JSON with per-field defaults
// =============================================================================
//
// Every field carries a serde default so that a partial (or empty) config
// file still loads; unknown keys are ignored. The `testing` block, when
// enabled, shortens the write interval and relocates `base_path` so that
// smoke runs never touch the production tree.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_write_interval_sec() -> i64 {
    60
}

fn default_reconnect_backoff() -> f64 {
    10.0
}

fn default_max_reconnect_backoff() -> f64 {
    300.0
}

fn default_reconnect_jitter() -> f64 {
    0.5
}

fn default_resample_interval_sec() -> i64 {
    1
}

fn default_parquet_compression() -> String {
    "snappy".to_string()
}

fn default_transform_schedule_minutes() -> u64 {
    60
}

fn default_macro_schedule_minutes() -> u64 {
    15
}

fn default_startup_lookback_days() -> i64 {
    7
}

fn default_runtime_lookback_days() -> i64 {
    1
}

fn default_report_interval_sec() -> u64 {
    60
}

fn default_max_queue() -> usize {
    1000
}

fn default_testing_write_interval_sec() -> i64 {
    1
}

fn default_testing_schedule_secs() -> u64 {
    30
}

fn default_testing_warmup_secs() -> u64 {
    5
}

fn default_testing_report_interval_sec() -> u64 {
    5
}

// =============================================================================
// Sections
// =============================================================================

/// One configured exchange feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Adapter name, e.g. "binance", "coinbase", "kraken".
    pub name: String,

    /// WebSocket endpoint the adapter builds its connect URL from.
    #[serde(default)]
    pub wss_url: String,

    /// Symbols to subscribe, as the venue spells them.
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Raw collector settings (journal rotation and reconnect policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Rotation window for raw journal files, in seconds.
    #[serde(default = "default_write_interval_sec")]
    pub write_interval_sec: i64,

    /// Initial reconnect backoff, seconds.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: f64,

    /// Backoff cap, seconds.
    #[serde(default = "default_max_reconnect_backoff")]
    pub max_reconnect_backoff: f64,

    /// Uniform jitter factor in [0, 1), applied as a fraction of the current
    /// backoff.
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            write_interval_sec: default_write_interval_sec(),
            reconnect_backoff: default_reconnect_backoff(),
            max_reconnect_backoff: default_max_reconnect_backoff(),
            reconnect_jitter: default_reconnect_jitter(),
        }
    }
}

/// Bar transformer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Aggregation bucket width in seconds (canonical: 1).
    #[serde(default = "default_resample_interval_sec")]
    pub resample_interval_sec: i64,

    /// Parquet compression codec: snappy, zstd, gzip, or none.
    #[serde(default = "default_parquet_compression")]
    pub parquet_compression: String,

    /// Minutes between transformer runs.
    #[serde(default = "default_transform_schedule_minutes")]
    pub schedule_minutes: u64,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            resample_interval_sec: default_resample_interval_sec(),
            parquet_compression: default_parquet_compression(),
            schedule_minutes: default_transform_schedule_minutes(),
        }
    }
}

/// Scheduled minute-bar fetcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroMinuteConfig {
    /// Keys (upstream tickers) to poll. Empty disables the fetcher.
    #[serde(default)]
    pub keys: Vec<String>,

    /// Minutes between scheduled fetches.
    #[serde(default = "default_macro_schedule_minutes")]
    pub schedule_minutes: u64,

    /// Days of history fetched once at startup.
    #[serde(default = "default_startup_lookback_days")]
    pub startup_lookback_days: i64,

    /// Days of history fetched on each scheduled run.
    #[serde(default = "default_runtime_lookback_days")]
    pub runtime_lookback_days: i64,
}

impl Default for MacroMinuteConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            schedule_minutes: default_macro_schedule_minutes(),
            startup_lookback_days: default_startup_lookback_days(),
            runtime_lookback_days: default_runtime_lookback_days(),
        }
    }
}

/// Health reporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between heartbeat/report writes.
    #[serde(default = "default_report_interval_sec")]
    pub report_interval_sec: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            report_interval_sec: default_report_interval_sec(),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber queue capacity; overflow drops the oldest element.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue: default_max_queue(),
        }
    }
}

/// Testing overrides. When `enabled`, intervals shrink to seconds and
/// `base_path` is relocated so runs stay isolated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Replacement data root. Defaults to `<base_path>/_testing`.
    #[serde(default)]
    pub base_path: Option<String>,

    #[serde(default = "default_testing_write_interval_sec")]
    pub write_interval_sec: i64,

    /// Seconds between transformer runs in test mode.
    #[serde(default = "default_testing_schedule_secs")]
    pub transform_schedule_secs: u64,

    /// Warm-up before the forced initial transformer run.
    #[serde(default = "default_testing_warmup_secs")]
    pub transform_warmup_secs: u64,

    /// Seconds between macro fetches in test mode.
    #[serde(default = "default_testing_schedule_secs")]
    pub macro_schedule_secs: u64,

    #[serde(default = "default_testing_report_interval_sec")]
    pub report_interval_sec: u64,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_path: None,
            write_interval_sec: default_testing_write_interval_sec(),
            transform_schedule_secs: default_testing_schedule_secs(),
            transform_warmup_secs: default_testing_warmup_secs(),
            macro_schedule_secs: default_testing_schedule_secs(),
            report_interval_sec: default_testing_report_interval_sec(),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level lake configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Absolute root of the data lake. Required.
    #[serde(default)]
    pub base_path: String,

    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub transformer: TransformerConfig,

    #[serde(default)]
    pub macro_minute: MacroMinuteConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub testing: TestingConfig,
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            exchanges = config.exchanges.len(),
            base_path = %config.base_path,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply the testing block, if enabled: shrink the write interval and
    /// relocate `base_path` to an isolated directory.
    pub fn apply_testing(&mut self) {
        if !self.testing.enabled {
            return;
        }
        if self.base_path.trim().is_empty() && self.testing.base_path.is_none() {
            // Nothing to relocate under; validation will reject this config.
            return;
        }

        let relocated = self
            .testing
            .base_path
            .clone()
            .unwrap_or_else(|| format!("{}/_testing", self.base_path.trim_end_matches('/')));

        info!(
            base_path = %relocated,
            write_interval_sec = self.testing.write_interval_sec,
            "testing mode active"
        );

        self.base_path = relocated;
        self.collector.write_interval_sec = self.testing.write_interval_sec;
    }

    /// Validate startup-fatal conditions. Everything else recovers locally.
    pub fn validate(&self) -> Result<()> {
        if self.base_path.trim().is_empty() {
            bail!("base_path is not configured");
        }
        if self.exchanges.is_empty() {
            bail!("no exchanges configured");
        }
        for ex in &self.exchanges {
            if ex.name.trim().is_empty() {
                bail!("exchange entry with empty name");
            }
            if ex.symbols.is_empty() {
                bail!("exchange {} has no symbols configured", ex.name);
            }
        }
        if self.collector.write_interval_sec <= 0 {
            bail!("write_interval_sec must be positive");
        }
        if self.transformer.resample_interval_sec <= 0 {
            bail!("resample_interval_sec must be positive");
        }
        Ok(())
    }

    /// Data root as a path.
    pub fn base(&self) -> PathBuf {
        PathBuf::from(&self.base_path)
    }

    /// Seconds between transformer runs, honouring test mode.
    pub fn transform_schedule(&self) -> std::time::Duration {
        if self.testing.enabled {
            std::time::Duration::from_secs(self.testing.transform_schedule_secs)
        } else {
            std::time::Duration::from_secs(self.transformer.schedule_minutes * 60)
        }
    }

    /// Seconds between macro fetches, honouring test mode.
    pub fn macro_schedule(&self) -> std::time::Duration {
        if self.testing.enabled {
            std::time::Duration::from_secs(self.testing.macro_schedule_secs)
        } else {
            std::time::Duration::from_secs(self.macro_minute.schedule_minutes * 60)
        }
    }

    /// Seconds between health report writes, honouring test mode.
    pub fn report_interval(&self) -> std::time::Duration {
        if self.testing.enabled {
            std::time::Duration::from_secs(self.testing.report_interval_sec)
        } else {
            std::time::Duration::from_secs(self.health.report_interval_sec)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "base_path": "/lake",
            "exchanges": [
                { "name": "binance", "wss_url": "wss://stream.example/ws", "symbols": ["BTCUSDT"] }
            ]
        }"#
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: Config = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(cfg.collector.write_interval_sec, 60);
        assert!((cfg.collector.reconnect_backoff - 10.0).abs() < f64::EPSILON);
        assert!((cfg.collector.max_reconnect_backoff - 300.0).abs() < f64::EPSILON);
        assert!((cfg.collector.reconnect_jitter - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.transformer.resample_interval_sec, 1);
        assert_eq!(cfg.transformer.parquet_compression, "snappy");
        assert_eq!(cfg.transformer.schedule_minutes, 60);
        assert_eq!(cfg.macro_minute.schedule_minutes, 15);
        assert_eq!(cfg.macro_minute.startup_lookback_days, 7);
        assert_eq!(cfg.macro_minute.runtime_lookback_days, 1);
        assert_eq!(cfg.health.report_interval_sec, 60);
        assert_eq!(cfg.bus.max_queue, 1000);
        assert!(!cfg.testing.enabled);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let json = r#"{
            "base_path": "/lake",
            "exchanges": [{ "name": "binance", "symbols": ["BTCUSDT"] }],
            "dashboard": { "port": 8080 },
            "not_a_real_key": true
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.base_path, "/lake");
    }

    #[test]
    fn validate_rejects_missing_base_path() {
        let cfg: Config = serde_json::from_str(r#"{ "exchanges": [{ "name": "binance", "symbols": ["X"] }] }"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_no_exchanges() {
        let cfg: Config = serde_json::from_str(r#"{ "base_path": "/lake" }"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_exchange_without_symbols() {
        let json = r#"{ "base_path": "/lake", "exchanges": [{ "name": "binance", "symbols": [] }] }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let cfg: Config = serde_json::from_str(minimal_json()).unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn testing_block_relocates_base_path() {
        let json = r#"{
            "base_path": "/lake",
            "exchanges": [{ "name": "binance", "symbols": ["BTCUSDT"] }],
            "testing": { "enabled": true }
        }"#;
        let mut cfg: Config = serde_json::from_str(json).unwrap();
        cfg.apply_testing();
        assert_eq!(cfg.base_path, "/lake/_testing");
        assert_eq!(cfg.collector.write_interval_sec, 1);
        assert_eq!(cfg.transform_schedule(), std::time::Duration::from_secs(30));
        assert_eq!(cfg.report_interval(), std::time::Duration::from_secs(5));
    }

    #[test]
    fn testing_block_disabled_is_inert() {
        let mut cfg: Config = serde_json::from_str(minimal_json()).unwrap();
        cfg.apply_testing();
        assert_eq!(cfg.base_path, "/lake");
        assert_eq!(cfg.collector.write_interval_sec, 60);
        assert_eq!(cfg.transform_schedule(), std::time::Duration::from_secs(3600));
    }

    #[test]
    fn schedules_follow_config_minutes() {
        let json = r#"{
            "base_path": "/lake",
            "exchanges": [{ "name": "binance", "symbols": ["BTCUSDT"] }],
            "transformer": { "schedule_minutes": 5 },
            "macro_minute": { "schedule_minutes": 2 }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.transform_schedule(), std::time::Duration::from_secs(300));
        assert_eq!(cfg.macro_schedule(), std::time::Duration::from_secs(120));
    }
}
