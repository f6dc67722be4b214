//! Non-blocking publish/subscribe with bounded per-subscriber rings.

use crate::{BuildEvent, EventRecord};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_RING_CAPACITY: usize = 1024;

#[derive(Debug)]
struct SubscriberState {
    id: u64,
    ring: VecDeque<EventRecord>,
    capacity: usize,
    degraded: bool,
    overflow: u64,
}

#[derive(Debug, Default)]
struct BusInner {
    subscribers: Vec<SubscriberState>,
}

/// Delivery statistics for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub pending: usize,
    pub degraded: bool,
    pub overflow: u64,
}

/// The build-wide event bus.
///
/// Cloning shares the bus; publishing from any clone fans out to every
/// live subscription. Publishers never block and never allocate beyond
/// the ring push.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    seq: Arc<AtomicU64>,
    next_subscriber: Arc<AtomicU64>,
    started: Instant,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner::default())),
            seq: Arc::new(AtomicU64::new(0)),
            next_subscriber: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    /// Subscribe with the default ring capacity.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().subscribers.push(SubscriberState {
            id,
            ring: VecDeque::with_capacity(capacity.min(DEFAULT_RING_CAPACITY)),
            capacity: capacity.max(1),
            degraded: false,
            overflow: 0,
        });
        Subscription {
            id,
            bus: self.clone(),
        }
    }

    /// Publish an event to every subscriber, in publish order.
    ///
    /// A full ring drops its oldest pending record, marks the subscriber
    /// degraded and counts the overflow; the publisher is never blocked.
    pub fn publish(&self, event: BuildEvent) -> EventRecord {
        let record = EventRecord {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            monotonic_ms: self.started.elapsed().as_millis() as u64,
            event,
        };

        let mut inner = self.inner.lock();
        for sub in &mut inner.subscribers {
            if sub.ring.len() >= sub.capacity {
                sub.ring.pop_front();
                sub.overflow += 1;
                if !sub.degraded {
                    sub.degraded = true;
                    tracing::warn!(subscriber = sub.id, "event subscriber degraded (ring overflow)");
                }
            }
            sub.ring.push_back(record.clone());
        }
        record
    }

    fn take_pending(&self, id: u64) -> Vec<EventRecord> {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .iter_mut()
            .find(|s| s.id == id)
            .map(|s| s.ring.drain(..).collect())
            .unwrap_or_default()
    }

    fn pop_one(&self, id: u64) -> Option<EventRecord> {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .iter_mut()
            .find(|s| s.id == id)
            .and_then(|s| s.ring.pop_front())
    }

    fn stats_for(&self, id: u64) -> SubscriptionStats {
        let inner = self.inner.lock();
        inner
            .subscribers
            .iter()
            .find(|s| s.id == id)
            .map(|s| SubscriptionStats {
                pending: s.ring.len(),
                degraded: s.degraded,
                overflow: s.overflow,
            })
            .unwrap_or(SubscriptionStats {
                pending: 0,
                degraded: false,
                overflow: 0,
            })
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.retain(|s| s.id != id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer handle; drop to unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: EventBus,
}

impl Subscription {
    /// Drain everything currently pending, in publish order.
    pub fn drain(&self) -> Vec<EventRecord> {
        self.bus.take_pending(self.id)
    }

    /// Pop the oldest pending record, if any.
    pub fn try_recv(&self) -> Option<EventRecord> {
        self.bus.pop_one(self.id)
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.bus.stats_for(self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(target: &str) -> BuildEvent {
        BuildEvent::TargetStarted {
            target: target.into(),
        }
    }

    #[test]
    fn test_publish_order_per_subscriber() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.publish(started("//a:a"));
        bus.publish(started("//b:b"));
        bus.publish(started("//c:c"));

        let records = sub.drain();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(records[0].event.target(), Some("//a:a"));
        assert_eq!(records[2].event.target(), Some("//c:c"));
    }

    #[test]
    fn test_multiple_subscribers_see_everything() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(started("//x:x"));
        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_overflow_degrades_subscriber_not_publisher() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(2);
        for i in 0..5 {
            bus.publish(started(&format!("//t:{}", i)));
        }

        let stats = sub.stats();
        assert!(stats.degraded);
        assert_eq!(stats.overflow, 3);

        // Oldest events were dropped; the newest two remain in order.
        let records = sub.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.target(), Some("//t:3"));
        assert_eq!(records[1].event.target(), Some("//t:4"));
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(started("//early:early"));
        let sub = bus.subscribe();
        bus.publish(started("//late:late"));
        let records = sub.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.target(), Some("//late:late"));
    }

    #[test]
    fn test_monotonic_fields_never_decrease() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for _ in 0..10 {
            bus.publish(started("//t:t"));
        }
        let records = sub.drain();
        for pair in records.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
            assert!(pair[0].monotonic_ms <= pair[1].monotonic_ms);
        }
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        drop(sub);
        // Publishing to zero subscribers is fine.
        bus.publish(started("//t:t"));
    }
}
