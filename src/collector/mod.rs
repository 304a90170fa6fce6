// =============================================================================
// Collector -- one WebSocket session per exchange with reconnect and fan-out
// =============================================================================
//
// The collector sustains one logical session against a venue: connect, send
// any subscriptions, then decode frames until the transport fails or
// shutdown is requested. Every decoded event goes to that symbol's raw
// writer and onto two bus channels (`<stream>:<SYMBOL>` and `all`). Decode
// problems are per-message and never end the session; transport problems
// end the session and trigger a backoff-and-reconnect.

pub mod events;
pub mod latency;
pub mod writer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::{Config, ExchangeConfig};
use crate::exchanges::{self, ExchangeAdapter};
use crate::health::{CollectorStatus, RunState};
use crate::lake;
use crate::shutdown::StopSignal;

use events::ConnectionEventLog;
use latency::LatencyWindow;
use writer::RotatingRawWriter;

/// Wildcard channel that receives every event.
pub const ALL_CHANNEL: &str = "all";

/// Per-recv timeout; the transport's own pings keep the link alive.
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the latency summary is logged and published to the status cell.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential reconnect backoff with uniform jitter.
///
/// Each failure doubles the delay up to the cap; jitter adds a uniform
/// amount in `[0, jitter_factor * current)`. A session that starts streaming
/// resets the delay to its initial value.
pub struct Backoff {
    initial: f64,
    max: f64,
    jitter: f64,
    current: f64,
}

impl Backoff {
    pub fn new(initial: f64, max: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter,
            current: initial,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.min(self.max);
        let jitter_range = self.jitter * base;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter_range)
        } else {
            0.0
        };
        self.current = (self.current * 2.0).min(self.max);
        Duration::from_secs_f64(base + jitter)
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

pub struct Collector {
    exchange: String,
    adapter: Box<dyn ExchangeAdapter>,
    writers: HashMap<String, RotatingRawWriter>,
    bus: Arc<EventBus>,
    status: Arc<Mutex<CollectorStatus>>,
    events_log: ConnectionEventLog,
    backoff: Backoff,
    latency: LatencyWindow,
    stop: StopSignal,
}

impl Collector {
    /// Build a collector for one configured exchange. Fails only on an
    /// unknown adapter name.
    pub fn new(
        cfg: &Config,
        ex: &ExchangeConfig,
        bus: Arc<EventBus>,
        status: Arc<Mutex<CollectorStatus>>,
        stop: StopSignal,
    ) -> Result<Self> {
        let adapter = exchanges::adapter_for(ex)?;
        let exchange = adapter.exchange().to_string();
        let base = cfg.base();

        let writers = ex
            .symbols
            .iter()
            .map(|symbol| {
                (
                    symbol.to_uppercase(),
                    RotatingRawWriter::new(
                        &base,
                        &exchange,
                        symbol,
                        cfg.collector.write_interval_sec,
                    ),
                )
            })
            .collect();

        Ok(Self {
            events_log: ConnectionEventLog::new(base, &exchange),
            exchange,
            adapter,
            writers,
            bus,
            status,
            backoff: Backoff::new(
                cfg.collector.reconnect_backoff,
                cfg.collector.max_reconnect_backoff,
                cfg.collector.reconnect_jitter,
            ),
            latency: LatencyWindow::new(),
            stop,
        })
    }

    /// Run until shutdown. Transport failures reconnect with backoff;
    /// configuration failures (a URL the transport rejects outright) are
    /// fatal to this collector only.
    pub async fn run(mut self) {
        info!(exchange = %self.exchange, symbols = self.writers.len(), "collector starting");
        self.status.lock().state = RunState::Running;

        while !self.stop.is_set() {
            match self.run_session().await {
                Ok(()) => {
                    if self.stop.is_set() {
                        break;
                    }
                    warn!(exchange = %self.exchange, "session ended; will reconnect");
                }
                Err(e) => {
                    if self.stop.is_set() {
                        break;
                    }
                    if is_config_error(&e) {
                        error!(exchange = %self.exchange, error = %e, "fatal collector configuration error");
                        let mut st = self.status.lock();
                        st.state = RunState::Error;
                        st.last_error = Some(e.to_string());
                        drop(st);
                        self.close_writers();
                        return;
                    }
                    error!(exchange = %self.exchange, error = %e, "session error; will reconnect");
                    self.status.lock().last_error = Some(e.to_string());
                }
            }

            let delay = self.backoff.next_delay();
            warn!(
                exchange = %self.exchange,
                delay_s = format!("{:.1}", delay.as_secs_f64()),
                "reconnecting after backoff"
            );
            self.events_log.reconnecting(delay.as_secs_f64());
            if self.stop.sleep(delay).await {
                break;
            }
        }

        self.close_writers();
        self.status.lock().state = RunState::Stopped;
        info!(exchange = %self.exchange, "collector stopped");
    }

    async fn run_session(&mut self) -> Result<()> {
        let url = self.adapter.connect_url();
        info!(exchange = %self.exchange, url = %url, "connecting");

        let (ws, _response) = connect_async(&url).await.context("websocket connect failed")?;
        let (mut write, mut read) = ws.split();

        for msg in self.adapter.subscribe_messages() {
            write
                .send(Message::Text(msg))
                .await
                .context("failed to send subscription")?;
        }

        info!(exchange = %self.exchange, "connected");
        self.events_log.connected();
        {
            let mut st = self.status.lock();
            st.state = RunState::Running;
            st.last_error = None;
        }

        let mut first_frame = true;
        let mut last_summary = Instant::now();

        loop {
            if self.stop.is_set() {
                return Ok(());
            }

            match tokio::time::timeout(RECV_TIMEOUT, read.next()).await {
                // Quiet minute: the transport's keepalive pings cover us.
                Err(_elapsed) => {}
                Ok(None) => {
                    warn!(exchange = %self.exchange, "websocket stream ended");
                    self.note_disconnect("stream ended");
                    return Ok(());
                }
                Ok(Some(Err(e))) => {
                    self.note_disconnect(&e.to_string());
                    return Err(e).context("websocket read error");
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    if first_frame {
                        // The session is genuinely streaming; reconnects
                        // start over from the initial backoff.
                        self.backoff.reset();
                        first_frame = false;
                    }
                    self.handle_frame(&text);
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    warn!(exchange = %self.exchange, frame = ?frame, "server closed connection");
                    self.note_disconnect("server close");
                    return Ok(());
                }
                // Ping/pong/binary frames are handled by the transport.
                Ok(Some(Ok(_))) => {}
            }

            if last_summary.elapsed() >= SUMMARY_INTERVAL {
                self.emit_latency_summary();
                last_summary = Instant::now();
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let ts_recv = lake::now_ms();
        let Some(event) = self.adapter.decode(text, ts_recv) else {
            return;
        };
        if event.symbol.is_empty() {
            return;
        }

        // Persistence first, then live fan-out, both non-blocking.
        if let Some(writer) = self.writers.get_mut(&event.symbol) {
            writer.write(&event, ts_recv);
        }

        self.latency.record(event.latency_ms());

        let channel = event.channel();
        self.bus.publish(&channel, &event);
        self.bus.publish(ALL_CHANNEL, &event);

        self.status.lock().last_seen = Some(Utc::now());
    }

    fn emit_latency_summary(&mut self) {
        let Some(summary) = self.latency.summary() else {
            return;
        };

        info!(
            exchange = %self.exchange,
            p50_ms = summary.p50_ms,
            p95_ms = summary.p95_ms,
            max_ms = summary.max_ms,
            samples = summary.samples,
            "latency summary"
        );
        if summary.is_degraded() {
            warn!(
                exchange = %self.exchange,
                p95_ms = summary.p95_ms,
                max_ms = summary.max_ms,
                "high feed latency"
            );
        }

        self.status.lock().latency = Some(summary);
    }

    fn note_disconnect(&mut self, reason: &str) {
        self.events_log.disconnected();
        let mut st = self.status.lock();
        st.disconnects += 1;
        st.last_error = Some(reason.to_string());
    }

    fn close_writers(&mut self) {
        for writer in self.writers.values_mut() {
            writer.close();
        }
    }
}

/// A URL the transport rejects outright will never connect; retrying is
/// pointless. Everything else is treated as transient.
fn is_config_error(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<WsError>(),
        Some(WsError::Url(_)) | Some(WsError::HttpFormat(_))
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
