// =============================================================================
// tidelake -- crypto market-data lake
// =============================================================================
//
// Long-running process: per-exchange WebSocket collectors journal raw events
// to rotating JSONL files and fan them out on an in-process bus; a periodic
// transformer turns each raw day into gap-filled one-second bars in
// partitioned parquet; a scheduled fetcher pulls external minute bars; a
// health reporter writes a heartbeat and a human-readable summary. SIGINT
// and SIGTERM stop everything gracefully.

mod bus;
mod collector;
mod config;
mod exchanges;
mod health;
mod lake;
mod macro_minute;
mod orchestrator;
mod shutdown;
mod transformer;
mod types;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("tidelake starting");

    let config_path =
        std::env::var("TIDELAKE_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let mut cfg = Config::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config; using defaults");
        Config::default()
    });
    cfg.apply_testing();

    match orchestrator::run(cfg).await {
        Ok(code) => {
            info!(code, "tidelake stopped");
            std::process::exit(code);
        }
        Err(e) => {
            error!(error = %e, "fatal initialisation error");
            std::process::exit(1);
        }
    }
}
