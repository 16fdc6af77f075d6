use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use fsm_core::{ProgressEvent, ProgressStage, ResourceKey};

use crate::fanout::{SubscriberId, SubscriberList, Subscription};

pub type ProgressSubscription = Subscription<ProgressEvent>;

#[derive(Debug)]
struct Inner {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<ResourceKey, SubscriberList<ProgressEvent>>>,
}

/// Keyed pub/sub for download and install progress.
///
/// Delivery is lossy: a full subscriber buffer drops the event, nothing is
/// queued or retried. Keys are fully independent of each other.
#[derive(Debug, Clone)]
pub struct ProgressRegistry {
    inner: Arc<Inner>,
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::with_capacity(crate::support::progress_subscriber_capacity())
    }
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self, key: ResourceKey) -> ProgressSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        tracing::debug!(key = %key, subscriber = id, "progress subscriber added");
        map.entry(key).or_default().add(id, self.inner.capacity)
    }

    pub fn unsubscribe(&self, key: &ResourceKey, id: SubscriberId) -> bool {
        let mut map = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(list) = map.get_mut(key) else {
            return false;
        };
        let removed = list.remove(id);
        if list.is_empty() {
            map.remove(key);
        }
        removed
    }

    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn publish(&self, key: &ResourceKey, stage: ProgressStage, percent: u8) {
        let event = ProgressEvent::new(stage, percent);
        let mut map = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(list) = map.get_mut(key) else {
            return;
        };
        list.send_all(&event);
        if list.is_empty() {
            map.remove(key);
        }
    }
}

/// `floor(transferred * 100 / expected)`, clamped to 100. `None` when the
/// expected size is unknown.
pub fn percent_of(transferred: u64, expected: u64) -> Option<u8> {
    if expected == 0 {
        return None;
    }
    let pct = (transferred as u128 * 100) / expected as u128;
    Some(pct.min(100) as u8)
}

/// Emits the progress of one operation under one key.
///
/// Within a stage only strictly increasing percents go out, so a stream never
/// moves backwards and a download emits at most 101 events.
#[derive(Debug)]
pub struct ProgressReporter {
    registry: ProgressRegistry,
    key: ResourceKey,
    last: Option<(ProgressStage, u8)>,
}

impl ProgressReporter {
    pub fn new(registry: ProgressRegistry, key: ResourceKey) -> Self {
        Self {
            registry,
            key,
            last: None,
        }
    }

    /// Opens `stage` with an explicit 0 event.
    pub fn begin(&mut self, stage: ProgressStage) {
        self.emit(stage, 0);
    }

    pub fn advance(&mut self, stage: ProgressStage, percent: u8) {
        let percent = percent.min(100);
        let floor = match self.last {
            Some((s, p)) if s == stage => p,
            _ => 0,
        };
        if percent > floor {
            self.emit(stage, percent);
        }
    }

    pub fn done(&mut self) {
        self.emit(ProgressStage::Done, 100);
    }

    fn emit(&mut self, stage: ProgressStage, percent: u8) {
        self.last = Some((stage, percent));
        self.registry.publish(&self.key, stage, percent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sub: &mut ProgressSubscription) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = sub.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn percent_of_floors_and_clamps() {
        assert_eq!(percent_of(0, 1000), Some(0));
        assert_eq!(percent_of(9, 1000), Some(0));
        assert_eq!(percent_of(10, 1000), Some(1));
        assert_eq!(percent_of(999, 1000), Some(99));
        assert_eq!(percent_of(1000, 1000), Some(100));
        assert_eq!(percent_of(5000, 1000), Some(100));
        assert_eq!(percent_of(10, 0), None);
    }

    #[test]
    fn keys_are_independent() {
        let registry = ProgressRegistry::with_capacity(16);
        let stable = ResourceKey::new("stable", "1.1.110");
        let mod_key = ResourceKey::new("Krastorio2", "1.3.0");
        let mut a = registry.subscribe(stable.clone());
        let mut b = registry.subscribe(mod_key.clone());

        registry.publish(&stable, ProgressStage::Download, 10);

        assert_eq!(drain(&mut a), vec![ProgressEvent::new(ProgressStage::Download, 10)]);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn overflow_drops_events_for_slow_subscriber_only() {
        let registry = ProgressRegistry::with_capacity(2);
        let key = ResourceKey::new("stable", "2.0.7");
        let mut slow = registry.subscribe(key.clone());
        let mut fast = registry.subscribe(key.clone());

        let mut fast_seen = Vec::new();
        for pct in 1..=5 {
            registry.publish(&key, ProgressStage::Download, pct);
            fast_seen.extend(drain(&mut fast).into_iter().map(|e| e.percent));
        }

        assert_eq!(fast_seen, vec![1, 2, 3, 4, 5]);
        let slow_seen: Vec<u8> = drain(&mut slow).into_iter().map(|e| e.percent).collect();
        assert_eq!(slow_seen, vec![1, 2]);
    }

    #[test]
    fn reporter_only_emits_increases_and_allows_stage_reset() {
        let registry = ProgressRegistry::with_capacity(64);
        let key = ResourceKey::new("experimental", "2.0.8");
        let mut sub = registry.subscribe(key.clone());
        let mut reporter = ProgressReporter::new(registry.clone(), key);

        for pct in [0, 3, 3, 50, 40, 100, 100] {
            reporter.advance(ProgressStage::Download, pct);
        }
        reporter.begin(ProgressStage::Unpack);
        for pct in [0, 10, 99, 50, 99] {
            reporter.advance(ProgressStage::Unpack, pct);
        }
        reporter.done();

        let events: Vec<(ProgressStage, u8)> =
            drain(&mut sub).into_iter().map(|e| (e.stage, e.percent)).collect();
        assert_eq!(
            events,
            vec![
                (ProgressStage::Download, 3),
                (ProgressStage::Download, 50),
                (ProgressStage::Download, 100),
                (ProgressStage::Unpack, 0),
                (ProgressStage::Unpack, 10),
                (ProgressStage::Unpack, 99),
                (ProgressStage::Done, 100),
            ]
        );
    }

    #[test]
    fn unsubscribe_drops_empty_keys() {
        let registry = ProgressRegistry::with_capacity(4);
        let key = ResourceKey::new("stable", "1.1.110");
        let sub = registry.subscribe(key.clone());
        assert_eq!(registry.subscriber_count(&key), 1);
        assert!(registry.unsubscribe(&key, sub.id()));
        assert_eq!(registry.subscriber_count(&key), 0);
        assert!(!registry.unsubscribe(&key, sub.id()));
    }
}
