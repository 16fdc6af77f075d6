use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use crate::fanout::{SubscriberId, SubscriberList, Subscription};

pub type LogSubscription = Subscription<String>;

#[derive(Debug)]
struct Inner {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<SubscriberList<String>>,
}

/// Fans server output lines out to any number of live consumers.
///
/// Publishing never blocks: a subscriber whose buffer is full misses the line.
#[derive(Debug, Clone)]
pub struct LogBroadcaster {
    inner: Arc<Inner>,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::with_capacity(crate::support::log_subscriber_capacity())
    }
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(SubscriberList::default()),
            }),
        }
    }

    pub fn subscribe(&self) -> LogSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let sub = subs.add(id, self.inner.capacity);
        tracing::debug!(subscriber = id, total = subs.len(), "log subscriber added");
        sub
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut subs = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subs.send_all(&line);
        }
        // Operator console always sees the line, even with zero subscribers.
        tracing::info!(target: "factorio", "{line}");
    }
}
