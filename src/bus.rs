// =============================================================================
// Event Bus -- in-process pub/sub with bounded drop-oldest queues
// =============================================================================
//
// Many publishers, many subscribers, keyed by string channel names. Publish
// never blocks and never suspends: a full subscriber queue sheds its oldest
// element. The registry lock covers only subscribe/unsubscribe/publish
// bookkeeping; each queue has its own lock and notify.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::types::CanonicalEvent;

// ---------------------------------------------------------------------------
// SubscriberQueue
// ---------------------------------------------------------------------------

/// Bounded FIFO owned by one subscriber. Overflow drops the oldest element
/// and bumps the dropped counter.
pub struct SubscriberQueue {
    buf: Mutex<VecDeque<CanonicalEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: CanonicalEvent) {
        {
            let mut buf = self.buf.lock();
            if buf.len() >= self.capacity {
                buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Pop the oldest queued event, if any.
    pub fn try_recv(&self) -> Option<CanonicalEvent> {
        self.buf.lock().pop_front()
    }

    /// Wait for the next event. Cancellation-safe: dropping the future
    /// leaves the queue untouched.
    pub async fn recv(&self) -> CanonicalEvent {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    /// Events shed from this queue since subscription.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Bus-wide counters surfaced in the health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

pub struct EventBus {
    registry: Mutex<HashMap<String, Vec<Arc<SubscriberQueue>>>>,
    max_queue: usize,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(max_queue: usize) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            max_queue,
            published: AtomicU64::new(0),
        }
    }

    /// Allocate a bounded queue and register it against `channel`.
    pub fn subscribe(&self, channel: &str) -> Arc<SubscriberQueue> {
        let queue = Arc::new(SubscriberQueue::new(self.max_queue));
        self.registry
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(queue.clone());
        queue
    }

    /// Remove one registration of `queue` from `channel`. After the final
    /// registration the queue is owned solely by the subscriber.
    pub fn unsubscribe(&self, channel: &str, queue: &Arc<SubscriberQueue>) {
        let mut registry = self.registry.lock();
        if let Some(queues) = registry.get_mut(channel) {
            queues.retain(|q| !Arc::ptr_eq(q, queue));
            if queues.is_empty() {
                registry.remove(channel);
            }
        }
    }

    /// Synchronous, non-blocking fan-out to every queue on `channel`. The
    /// registry lock covers only the lookup; each enqueue uses the queue's
    /// own lock.
    pub fn publish(&self, channel: &str, event: &CanonicalEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let queues = {
            let registry = self.registry.lock();
            match registry.get(channel) {
                Some(queues) => queues.clone(),
                None => return,
            }
        };
        for queue in &queues {
            queue.push(event.clone());
        }
    }

    pub fn stats(&self) -> BusStats {
        let registry = self.registry.lock();

        // A queue may be registered on several channels; count it once.
        let mut seen: HashSet<*const SubscriberQueue> = HashSet::new();
        let mut dropped = 0u64;
        for queues in registry.values() {
            for queue in queues {
                if seen.insert(Arc::as_ptr(queue)) {
                    dropped += queue.dropped();
                }
            }
        }

        BusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped,
            subscribers: seen.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
