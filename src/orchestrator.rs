// =============================================================================
// Orchestrator -- one supervisor for collectors, fetcher, transformer, health
// =============================================================================
//
// Startup order: stop signal and bus first, then one task per exchange
// collector, the macro fetcher (immediate startup backfill, then periodic),
// the transformer (periodic; in test mode a short warm-up then a forced
// first run), and finally the health reporter. Shutdown sets the shared
// stop flag, joins every task with a bounded timeout, and writes one final
// snapshot with every subsystem marked stopped.
//
// Failure isolation: a collector's fatal error ends only that collector's
// task; the transformer and fetcher isolate failures per symbol and per key
// internally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::collector::Collector;
use crate::config::Config;
use crate::exchanges;
use crate::health::{self, FetcherStatus, StatusBoard, TransformerStatus};
use crate::macro_minute;
use crate::shutdown::StopSignal;
use crate::transformer;

/// How long shutdown waits for each task before moving on.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the whole lake until a shutdown signal arrives. Returns the process
/// exit code (0 clean stop, 130 on Ctrl-C).
pub async fn run(cfg: Config) -> Result<i32> {
    cfg.validate().context("invalid configuration")?;
    // Unknown adapter names are a startup error, not a runtime surprise.
    for ex in &cfg.exchanges {
        exchanges::adapter_for(ex)
            .with_context(|| format!("exchange {} cannot start", ex.name))?;
    }

    let cfg = Arc::new(cfg);
    let stop = StopSignal::new();
    let bus = Arc::new(EventBus::new(cfg.bus.max_queue));
    let board = Arc::new(StatusBoard::new(
        cfg.exchanges.iter().map(|e| e.name.to_lowercase()),
    ));
    let started = Instant::now();

    let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

    // One collector task per exchange.
    for ex in &cfg.exchanges {
        let name = ex.name.to_lowercase();
        let status = board
            .collectors
            .get(&name)
            .cloned()
            .context("collector status cell missing")?;
        let collector = Collector::new(&cfg, ex, bus.clone(), status, stop.clone())?;
        tasks.push((
            format!("collector:{name}"),
            tokio::spawn(collector.run()),
        ));
    }

    // Scheduled macro fetcher, if any keys are configured.
    if cfg.macro_minute.keys.is_empty() {
        warn!("no macro keys configured; fetcher disabled");
    } else {
        let task_cfg = cfg.clone();
        let status = board.macro_minute.clone();
        let task_stop = stop.clone();
        tasks.push((
            "macro-fetcher".to_string(),
            tokio::spawn(async move { run_macro_loop(task_cfg, status, task_stop).await }),
        ));
    }

    // Periodic transformer.
    {
        let task_cfg = cfg.clone();
        let status = board.transformer.clone();
        let task_stop = stop.clone();
        tasks.push((
            "transformer".to_string(),
            tokio::spawn(async move { run_transform_loop(task_cfg, status, task_stop).await }),
        ));
    }

    // Health reporter.
    {
        let task_cfg = cfg.clone();
        let task_board = board.clone();
        let task_bus = bus.clone();
        let task_stop = stop.clone();
        tasks.push((
            "health-reporter".to_string(),
            tokio::spawn(async move {
                run_health_loop(task_cfg, task_board, task_bus, task_stop, started).await
            }),
        ));
    }

    info!(tasks = tasks.len(), "all subsystems launched");

    let exit_code = wait_for_signal(&stop).await;
    warn!("shutdown requested; stopping all tasks");
    stop.set();

    for (name, handle) in tasks {
        let abort = handle.abort_handle();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => info!(task = %name, "task stopped"),
            Ok(Err(e)) => warn!(task = %name, error = %e, "task ended abnormally"),
            Err(_) => {
                warn!(
                    task = %name,
                    timeout_s = SHUTDOWN_TIMEOUT.as_secs(),
                    "task did not stop in time; aborting"
                );
                abort.abort();
            }
        }
    }

    // Final snapshot with everything marked stopped.
    board.mark_all_stopped();
    let snapshot = health::build_snapshot(&cfg.base(), &board, &bus, started.elapsed());
    if let Err(e) = health::write_artifacts(&cfg.base(), &snapshot) {
        warn!(error = %e, "failed to write final health snapshot");
    } else {
        info!("final health snapshot written");
    }

    Ok(exit_code)
}

// ---------------------------------------------------------------------------
// Component loops
// ---------------------------------------------------------------------------

async fn run_macro_loop(
    cfg: Arc<Config>,
    status: Arc<Mutex<FetcherStatus>>,
    stop: StopSignal,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "falling back to default HTTP client");
            reqwest::Client::new()
        }
    };

    info!(
        keys = cfg.macro_minute.keys.len(),
        lookback_days = cfg.macro_minute.startup_lookback_days,
        "macro fetcher starting with startup backfill"
    );
    macro_minute::run_fetch(
        &cfg,
        &client,
        &status,
        cfg.macro_minute.startup_lookback_days,
        &stop,
    )
    .await;

    loop {
        if stop.sleep(cfg.macro_schedule()).await {
            break;
        }
        macro_minute::run_fetch(
            &cfg,
            &client,
            &status,
            cfg.macro_minute.runtime_lookback_days,
            &stop,
        )
        .await;
    }

    status.lock().state = health::RunState::Stopped;
    info!("macro fetcher stopped");
}

async fn run_transform_loop(
    cfg: Arc<Config>,
    status: Arc<Mutex<TransformerStatus>>,
    stop: StopSignal,
) {
    if cfg.testing.enabled {
        // Test mode: short warm-up, then a forced initial run so smoke tests
        // see output without waiting a full interval.
        let warmup = Duration::from_secs(cfg.testing.transform_warmup_secs);
        info!(warmup_s = warmup.as_secs(), "test mode: forced initial transform after warm-up");
        if !stop.sleep(warmup).await {
            transform_once(&cfg, &status).await;
        }
    }

    loop {
        if stop.sleep(cfg.transform_schedule()).await {
            break;
        }
        transform_once(&cfg, &status).await;
    }

    status.lock().state = health::RunState::Stopped;
    info!("transformer stopped");
}

/// One transformer run for today's UTC date, off the async threads.
async fn transform_once(cfg: &Arc<Config>, status: &Arc<Mutex<TransformerStatus>>) {
    let cfg = cfg.clone();
    let status = status.clone();
    let date = Utc::now().date_naive();

    let result =
        tokio::task::spawn_blocking(move || transformer::run_for_date(&cfg, date, &status)).await;
    if let Err(e) = result {
        error!(error = %e, "transformer run task failed");
    }
}

async fn run_health_loop(
    cfg: Arc<Config>,
    board: Arc<StatusBoard>,
    bus: Arc<EventBus>,
    stop: StopSignal,
    started: Instant,
) {
    loop {
        let snapshot = health::build_snapshot(&cfg.base(), &board, &bus, started.elapsed());
        if let Err(e) = health::write_artifacts(&cfg.base(), &snapshot) {
            warn!(error = %e, "failed to write health artefacts");
        }

        if stop.sleep(cfg.report_interval()).await {
            break;
        }
    }
    info!("health reporter stopped");
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Wait for SIGINT or SIGTERM (or an internal stop) and map it to the exit
/// code contract: 130 for Ctrl-C, 0 for a clean stop.
async fn wait_for_signal(stop: &StopSignal) -> i32 {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        warn!("SIGINT received");
                        130
                    }
                    _ = term.recv() => {
                        warn!("SIGTERM received");
                        0
                    }
                    _ = stop.wait() => 0,
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler; Ctrl-C only");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => 130,
                    _ = stop.wait() => 0,
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => 130,
            _ = stop.wait() => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_config_is_fatal() {
        let err = run(Config::default()).await.unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[tokio::test]
    async fn unknown_adapter_is_fatal_at_startup() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "base_path": "/tmp/lake-test",
                "exchanges": [{ "name": "bitfake", "symbols": ["XUSDT"] }]
            }"#,
        )
        .unwrap();
        let err = run(cfg).await.unwrap_err();
        assert!(err.to_string().contains("bitfake"));
    }
}
