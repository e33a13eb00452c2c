//! In-process event bus.
//!
//! Pub/sub keyed by dot-separated topics. Subscription patterns support
//! `*` for a single segment and a trailing `**` for any remaining
//! segments. Delivery is best-effort and asynchronous: every subscriber
//! owns a bounded queue that drops its oldest event on overflow, so a slow
//! subscriber can never block a publisher.
//!
//! Lifecycle events for one task id are published from a single task in
//! strict temporal order; the per-subscriber queue preserves that order.
//! Publishes from a routine-originated publisher to `routine.*` topics are
//! rejected to prevent routine → routine storms.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};

use sentinel_types::errors::SentinelError;

/// Default per-subscriber queue capacity.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One published event.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
}

struct SubscriptionInner {
    pattern: String,
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    /// Count of events dropped due to overflow.
    dropped: Mutex<u64>,
}

/// A handle to a subscriber's bounded queue.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Receive the next event, waiting if the queue is empty.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Pop the next event without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        self.inner.queue.lock().unwrap().pop_front()
    }

    /// Events lost to overflow since subscribing.
    pub fn dropped(&self) -> u64 {
        *self.inner.dropped.lock().unwrap()
    }
}

/// Async pub/sub event bus with wildcard topic matching.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<SubscriptionInner>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic pattern with the default queue capacity.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.subscribe_with_capacity(pattern, DEFAULT_QUEUE_CAPACITY)
    }

    /// Subscribe with an explicit queue capacity.
    pub fn subscribe_with_capacity(&self, pattern: &str, capacity: usize) -> Subscription {
        let inner = Arc::new(SubscriptionInner {
            pattern: pattern.to_string(),
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: Mutex::new(0),
        });
        self.subscribers.lock().unwrap().push(inner.clone());
        debug!(event = "bus_subscribe", pattern);
        Subscription { inner }
    }

    /// Publish an event to all matching subscribers. Never blocks: full
    /// queues drop their oldest event.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let mut subscribers = self.subscribers.lock().unwrap();

        // Prune subscriptions whose handles were dropped.
        subscribers.retain(|sub| Arc::strong_count(sub) > 1);

        for sub in subscribers.iter() {
            if !topic_matches(&sub.pattern, topic) {
                continue;
            }
            let mut queue = sub.queue.lock().unwrap();
            if queue.len() >= sub.capacity {
                queue.pop_front();
                *sub.dropped.lock().unwrap() += 1;
                warn!(
                    event = "bus_overflow",
                    pattern = %sub.pattern,
                    topic,
                );
            }
            queue.push_back(Event {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
            drop(queue);
            sub.notify.notify_one();
        }
    }

    /// Publish on behalf of a named publisher. Routine publishers cannot
    /// publish into the routine topic family.
    pub fn publish_from(
        &self,
        publisher: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<(), SentinelError> {
        if publisher.starts_with("routine") && topic.starts_with("routine.") {
            return Err(SentinelError::Bus(format!(
                "routine publisher '{publisher}' may not publish to '{topic}'"
            )));
        }
        self.publish(topic, payload);
        Ok(())
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| Arc::strong_count(sub) > 1);
        subscribers.len()
    }
}

/// Match a dot-separated topic against a pattern with `*` (one segment)
/// and trailing `**` (any remaining segments).
fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let topic_segments: Vec<&str> = topic.split('.').collect();

    for (i, pseg) in pattern_segments.iter().enumerate() {
        if *pseg == "**" {
            // Trailing ** matches any (possibly empty) remainder.
            return i == pattern_segments.len() - 1;
        }
        let Some(tseg) = topic_segments.get(i) else {
            return false;
        };
        if *pseg != "*" && pseg != tseg {
            return false;
        }
    }

    pattern_segments.len() == topic_segments.len()
}

// ============================================================
// Tests
// ============================================================
