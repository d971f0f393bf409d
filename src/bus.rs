//! Same-context publish/subscribe bus.
//!
//! `publish` runs every subscriber for the key synchronously, in
//! registration order, before returning. Nothing is queued: a subscriber
//! added after a publish never sees it. The bus does remember the last
//! value published per key, which is what writers resolve updates against.
//!
//! The bus carries no cross-context semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

/// Subscriber callback
pub type SubscriberFn = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: SubscriberFn,
}

#[derive(Default)]
struct Topic {
    latest: Option<Value>,
    subscribers: Vec<Subscriber>,
}

/// Per-context registry of subscribers, one set per key.
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, Topic>>,
    next_id: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest value published for `key` in this context.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.topics().get(key).and_then(|t| t.latest.clone())
    }

    /// Record `value` as the latest for `key` and invoke every subscriber.
    ///
    /// Callbacks run after the internal lock is released, so they may
    /// publish or subscribe themselves.
    pub fn publish(&self, key: &str, value: Value) {
        let callbacks: Vec<SubscriberFn> = {
            let mut topics = self.topics();
            let topic = topics.entry(key.to_string()).or_default();
            topic.latest = Some(value.clone());
            topic
                .subscribers
                .iter()
                .map(|s| s.callback.clone())
                .collect()
        };

        for callback in callbacks {
            callback(&value);
        }
    }

    /// Publish `value` only if nothing is recorded for `key` yet.
    ///
    /// `on_publish` runs under the bus lock before any subscriber is
    /// invoked, so a later `publish` for the key cannot be ordered ahead of
    /// it. Returns `false`, and publishes nothing, if the key already has a
    /// value.
    pub fn publish_if_absent<F>(&self, key: &str, value: Value, on_publish: F) -> bool
    where
        F: FnOnce(),
    {
        let callbacks: Vec<SubscriberFn> = {
            let mut topics = self.topics();
            let topic = topics.entry(key.to_string()).or_default();
            if topic.latest.is_some() {
                return false;
            }
            topic.latest = Some(value.clone());
            on_publish();
            topic
                .subscribers
                .iter()
                .map(|s| s.callback.clone())
                .collect()
        };

        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Register `callback` for `key`. Dropping the returned guard
    /// unsubscribes.
    pub fn subscribe<F>(self: &Arc<Self>, key: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics()
            .entry(key.to_string())
            .or_default()
            .subscribers
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });

        Subscription {
            bus: Arc::downgrade(self),
            key: key.to_string(),
            id,
        }
    }

    /// Number of live subscribers for `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.topics()
            .get(key)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    fn remove(&self, key: &str, id: u64) {
        let mut topics = self.topics();
        if let Some(topic) = topics.get_mut(key) {
            topic.subscribers.retain(|s| s.id != id);
            // Nobody mirrors the key any more, so the last value may go stale
            if topic.subscribers.is_empty() {
                topics.remove(key);
            }
        }
    }
}

/// Handle to a bus subscription. Unsubscribes on drop.
pub struct Subscription {
    bus: Weak<LocalBus>,
    key: String,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the subscriber now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.key, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
