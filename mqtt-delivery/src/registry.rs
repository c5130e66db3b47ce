//! Reference counting for active subscriptions
//!
//! Every successful subscribe registers one reference and hands the caller a
//! [`SubscriptionHandle`]. The registry answers two questions for the session
//! layer: whether the last reference to a topic just went away (so the broker
//! subscription can be removed), and whether any reference is still alive (so
//! the delivery queue must stay open).

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::{DeliveryError, Result};
use crate::event::QoS;

/// Unique identifier of one registered subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Caller-owned token for one subscription
///
/// Not `Clone`: a subscription is released exactly once, by handing the handle
/// back to `unsubscribe`.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: String,
    qos: QoS,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }
}

/// Result of releasing one reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub topic: String,
    /// References still held on the same topic
    pub remaining_for_topic: usize,
    /// References still held across all topics
    pub remaining_total: usize,
}

impl Release {
    /// The broker subscription for this topic is no longer needed
    pub fn is_last_for_topic(&self) -> bool {
        self.remaining_for_topic == 0
    }
}

struct RegistryInner {
    /// topic -> reference count
    topics: DashMap<String, usize>,
    /// id -> (topic, qos)
    handles: DashMap<SubscriptionId, (String, QoS)>,
    total: AtomicUsize,
    next_id: AtomicU64,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

/// Thread-safe subscription reference counter
///
/// Clones share the same counts.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                topics: DashMap::new(),
                handles: DashMap::new(),
                total: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                idle_lock: Mutex::new(()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Register one reference to `topic` and return its handle
    pub fn register(&self, topic: impl Into<String>, qos: QoS) -> SubscriptionHandle {
        let topic = topic.into();
        let id = SubscriptionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        self.inner.handles.insert(id, (topic.clone(), qos));
        {
            let mut count = self.inner.topics.entry(topic.clone()).or_insert(0);
            *count += 1;

            tracing::debug!(
                "Subscription reference count for {}: {} -> {}",
                topic,
                *count - 1,
                *count
            );
        }
        self.inner.total.fetch_add(1, Ordering::AcqRel);

        SubscriptionHandle { id, topic, qos }
    }

    /// Release the reference held by `handle`
    ///
    /// Fails with `DeliveryError::UnknownSubscription` when the handle was
    /// already released or retired by `clear()`.
    pub fn release(&self, handle: &SubscriptionHandle) -> Result<Release> {
        let Some((_, (topic, _))) = self.inner.handles.remove(&handle.id) else {
            tracing::warn!(
                "Attempted to release subscription {} on {} but no reference found",
                handle.id,
                handle.topic
            );
            return Err(DeliveryError::UnknownSubscription(handle.id));
        };

        let remaining_for_topic = match self.inner.topics.entry(topic.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let old_count = *entry.get();
                let new_count = old_count.saturating_sub(1);
                tracing::debug!(
                    "Subscription reference count for {}: {} -> {}",
                    topic,
                    old_count,
                    new_count
                );
                if new_count == 0 {
                    entry.remove();
                } else {
                    *entry.get_mut() = new_count;
                }
                new_count
            }
            dashmap::mapref::entry::Entry::Vacant(_) => 0,
        };

        let remaining_total = self.decrement_total(1);

        Ok(Release {
            topic,
            remaining_for_topic,
            remaining_total,
        })
    }

    /// Total number of live references
    pub fn count(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Number of live references to `topic`
    pub fn topic_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |count| *count)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topic_count(topic) > 0
    }

    /// Whether the delivery queue may be closed
    pub fn close_permitted(&self) -> bool {
        self.count() == 0
    }

    /// Topics with at least one reference and the highest QoS requested for each
    pub fn active_topics(&self) -> Vec<(String, QoS)> {
        let mut topics: Vec<(String, QoS)> = Vec::new();
        for entry in self.inner.handles.iter() {
            let (topic, qos) = entry.value();
            match topics.iter_mut().find(|(t, _)| t == topic) {
                Some((_, max)) => *max = (*max).max(*qos),
                None => topics.push((topic.clone(), *qos)),
            }
        }
        topics.sort_by(|a, b| a.0.cmp(&b.0));
        topics
    }

    /// Block until the count reaches zero or `timeout` expires
    ///
    /// Returns true when the registry is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.idle_lock.lock();
        while self.count() > 0 {
            if self.inner.idle.wait_until(&mut guard, deadline).timed_out() {
                return self.count() == 0;
            }
        }
        true
    }

    /// Retire every reference; returns how many were live
    ///
    /// Handles issued before the call become unknown to `release`.
    pub fn clear(&self) -> usize {
        let ids: Vec<SubscriptionId> = self.inner.handles.iter().map(|e| *e.key()).collect();
        let mut retired = 0;
        for id in ids {
            if let Some((_, (topic, _))) = self.inner.handles.remove(&id) {
                if let dashmap::mapref::entry::Entry::Occupied(mut entry) =
                    self.inner.topics.entry(topic)
                {
                    let remaining = entry.get().saturating_sub(1);
                    if remaining == 0 {
                        entry.remove();
                    } else {
                        *entry.get_mut() = remaining;
                    }
                }
                retired += 1;
            }
        }

        if retired > 0 {
            self.decrement_total(retired);
            tracing::debug!("Retired {} subscriptions", retired);
        }
        retired
    }

    fn decrement_total(&self, by: usize) -> usize {
        let previous = self
            .inner
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(by))
            })
            .unwrap_or(0);
        let remaining = previous.saturating_sub(by);

        if remaining == 0 {
            let _guard = self.inner.idle_lock.lock();
            self.inner.idle.notify_all();
        }
        remaining
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("count", &self.count())
            .field("topics", &self.inner.topics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reference_counting() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.close_permitted());

        let first = registry.register("topic/a", QoS::AtMostOnce);
        let second = registry.register("topic/a", QoS::AtLeastOnce);
        let other = registry.register("topic/b", QoS::AtMostOnce);

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.topic_count("topic/a"), 2);
        assert!(!registry.close_permitted());
        assert_ne!(first.id(), second.id());

        let release = registry.release(&first).unwrap();
        assert!(!release.is_last_for_topic());
        assert_eq!(release.remaining_total, 2);

        let release = registry.release(&second).unwrap();
        assert!(release.is_last_for_topic());
        assert!(!registry.is_subscribed("topic/a"));

        registry.release(&other).unwrap();
        assert_eq!(registry.count(), 0);
        assert!(registry.close_permitted());
    }

    #[test]
    fn test_double_release_is_rejected() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.register("topic/a", QoS::AtMostOnce);

        registry.release(&handle).unwrap();
        let err = registry.release(&handle).unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownSubscription(id) if id == handle.id()));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_active_topics_keep_highest_qos() {
        let registry = SubscriptionRegistry::new();
        let _a0 = registry.register("topic/a", QoS::AtMostOnce);
        let _a2 = registry.register("topic/a", QoS::ExactlyOnce);
        let _b1 = registry.register("topic/b", QoS::AtLeastOnce);

        assert_eq!(
            registry.active_topics(),
            vec![
                ("topic/a".to_string(), QoS::ExactlyOnce),
                ("topic/b".to_string(), QoS::AtLeastOnce),
            ]
        );
    }

    #[test]
    fn test_clear_retires_handles() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.register("topic/a", QoS::AtMostOnce);
        let _other = registry.register("topic/b", QoS::AtMostOnce);

        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.count(), 0);
        assert!(registry.active_topics().is_empty());
        assert!(registry.release(&handle).is_err());
        assert_eq!(registry.clear(), 0);
    }

    #[test]
    fn test_wait_idle() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.wait_idle(Duration::from_millis(1)));

        let handle = registry.register("topic/a", QoS::AtMostOnce);
        assert!(!registry.wait_idle(Duration::from_millis(20)));

        let releaser = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.release(&handle).unwrap();
            })
        };

        assert!(registry.wait_idle(Duration::from_secs(2)));
        releaser.join().unwrap();
    }

    #[test]
    fn test_concurrent_register_release() {
        let registry = SubscriptionRegistry::new();

        let workers: Vec<_> = (0..8)
            .map(|n| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let handle = registry.register(format!("topic/{}", n % 3), QoS::AtMostOnce);
                        registry.release(&handle).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(registry.count(), 0);
        assert!(registry.active_topics().is_empty());
    }
}
