//! Bounded ingest queues for inbound cluster traffic.
//!
//! Heartbeats and announcements have opposite overflow policies:
//! heartbeats drop the oldest element (liveness preferred over
//! completeness -- a newer heartbeat supersedes an older one anyway),
//! while announcements use a bounded mpsc channel whose `send` blocks the
//! producer (correctness preferred over liveness).

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Queue depth for inbound heartbeats, announcements, diagnosis requests
/// and recovery enqueues.
pub const INGEST_QUEUE_DEPTH: usize = 100;

/// Bounded queue that evicts its oldest element on overflow.
pub struct DropOldestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> DropOldestQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Pushes an item, evicting the oldest when full. Returns `true` if an
    /// element was dropped.
    pub fn push(&self, item: T) -> bool {
        let dropped = {
            let mut items = self.items.lock();
            let dropped = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Pops the oldest item, waiting until one is available.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Pops without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
