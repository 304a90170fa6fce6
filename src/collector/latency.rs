// =============================================================================
// Latency Window -- rolling receive-minus-event statistics
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

/// Samples retained in the rolling window.
const WINDOW_SIZE: usize = 1000;

/// p95 latency above this triggers a warning, milliseconds.
pub const P95_WARN_MS: i64 = 2000;
/// Max latency above this triggers a warning, milliseconds.
pub const MAX_WARN_MS: i64 = 5000;

/// Percentile summary over the current window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencySummary {
    pub p50_ms: i64,
    pub p95_ms: i64,
    pub max_ms: i64,
    pub samples: usize,
}

impl LatencySummary {
    /// Whether this summary crosses the operator warning thresholds.
    pub fn is_degraded(&self) -> bool {
        self.p95_ms > P95_WARN_MS || self.max_ms > MAX_WARN_MS
    }
}

/// Bounded window of `ts_recv - ts_event` samples for one session.
pub struct LatencyWindow {
    samples: VecDeque<i64>,
}

impl LatencyWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_SIZE),
        }
    }

    pub fn record(&mut self, latency_ms: i64) {
        if self.samples.len() == WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    /// Current p50/p95/max, or None while the window is empty.
    pub fn summary(&self) -> Option<LatencySummary> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<i64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() as f64 * 0.95) as usize];
        let max = sorted[sorted.len() - 1];

        Some(LatencySummary {
            p50_ms: p50,
            p95_ms: p95,
            max_ms: max,
            samples: sorted.len(),
        })
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new()
    }
}
