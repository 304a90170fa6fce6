// =============================================================================
// Stop Signal -- cooperative shutdown broadcast
// =============================================================================
//
// One shared flag, checked at every loop boundary. Pairing the flag with a
// Notify lets sleeping tasks wake immediately instead of finishing their
// current interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Request shutdown. Idempotent; wakes every sleeper.
    pub fn set(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `dur` or until shutdown is requested, whichever comes first.
    /// Returns true when shutdown was requested.
    pub async fn sleep(&self, dur: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.is_set(),
            _ = self.inner.notify.notified() => true,
        }
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        while !self.is_set() {
            self.inner.notify.notified().await;
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_returns_false_when_not_stopped() {
        let stop = StopSignal::new();
        assert!(!stop.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn set_wakes_sleepers_early() {
        let stop = StopSignal::new();
        let waker = stop.clone();
        let handle = tokio::spawn(async move { waker.sleep(Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.set();

        let stopped = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sleeper should wake promptly")
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn set_is_idempotent_and_visible_to_clones() {
        let stop = StopSignal::new();
        let clone = stop.clone();
        stop.set();
        stop.set();
        assert!(clone.is_set());
        assert!(clone.sleep(Duration::from_secs(60)).await);
    }
}
