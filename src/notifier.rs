//! Debounced cross-context notifier.
//!
//! Pushes a locally written value to every other live context. Each key has
//! one pending broadcast and one live timer at most: scheduling again
//! replaces the pending value, aborts the superseded timer and restarts the
//! window. A timer only leaves the pending map once it fires, so an abort
//! never lands on a send that has started. The generation check in `fire`
//! covers a timer that woke before it could be aborted.
//!
//! Delivery is best-effort. A target that has gone away fails on its own
//! and does not hold up the others. There is no ordering between keys or
//! between targets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{DebounceClass, DebounceConfig};
use crate::transport::{ContextTransport, StateChangeMessage};

struct PendingBroadcast {
    generation: u64,
    value: Value,
    timer: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    superseded: AtomicU64,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Notifier statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierStats {
    /// Calls to `schedule`
    pub scheduled: u64,
    /// Pending broadcasts replaced by a newer value before their window ran out
    pub superseded: u64,
    /// Windows that elapsed and fanned out
    pub broadcasts: u64,
    /// Successful per-target sends
    pub delivered: u64,
    /// Failed per-target sends
    pub failed: u64,
}

/// Per-context broadcaster for locally originated changes.
pub struct CrossContextNotifier {
    transport: Arc<dyn ContextTransport>,
    debounce: DebounceConfig,
    pending: Mutex<HashMap<String, PendingBroadcast>>,
    next_generation: AtomicU64,
    counters: Counters,
}

impl CrossContextNotifier {
    pub fn new(transport: Arc<dyn ContextTransport>, debounce: DebounceConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            debounce,
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            counters: Counters::default(),
        })
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingBroadcast>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `value` for broadcast once `key` has been quiet for the
    /// window of `class`. Must be called within a tokio runtime.
    pub fn schedule(self: &Arc<Self>, key: &str, value: Value, class: DebounceClass) {
        let window = self.debounce.window_for(class);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);

        let notifier = Arc::clone(self);
        let timer_key = key.to_string();

        // Held across the spawn so the timer cannot fire before its entry exists
        let mut pending = self.pending();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            notifier.fire(&timer_key, generation).await;
        });
        let previous = pending.insert(
            key.to_string(),
            PendingBroadcast {
                generation,
                value,
                timer,
            },
        );
        drop(pending);

        if let Some(previous) = previous {
            previous.timer.abort();
            self.counters.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Pending broadcast superseded");
        }
    }

    async fn fire(&self, key: &str, generation: u64) {
        let value = {
            let mut pending = self.pending();
            let current = pending.get(key).map(|p| p.generation) == Some(generation);
            if current {
                pending.remove(key).map(|p| p.value)
            } else {
                None
            }
        };

        if let Some(value) = value {
            self.broadcast(key, value).await;
        }
    }

    async fn broadcast(&self, key: &str, value: Value) {
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        let peers = self.transport.peers().await;
        let origin = self.transport.local_id().clone();

        let sends = peers.iter().map(|target| {
            let message = StateChangeMessage::new(key, value.clone(), origin.clone());
            async move { (target, self.transport.send(target, message).await) }
        });

        for (target, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, target = %target, "State change delivered");
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, target = %target, error = %e, "State change delivery failed");
                }
            }
        }
    }

    /// Number of keys with a broadcast waiting on its window.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Get current stats.
    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            superseded: self.counters.superseded.load(Ordering::Relaxed),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ContextId, InProcessHub};
    use serde_json::json;
    use std::time::Duration;

    fn debounce() -> DebounceConfig {
        DebounceConfig {
            discrete_ms: 0,
            free_text_ms: 300,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last_value() {
        let hub = InProcessHub::new();
        let (popup, _popup_inbox) = hub.connect("popup".into());
        let (_page, mut page_inbox) = hub.connect("page".into());
        let notifier = CrossContextNotifier::new(Arc::new(popup), debounce());

        for text in ["h", "he", "hel", "hell", "hello"] {
            notifier.schedule("note", json!(text), DebounceClass::FreeText);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(page_inbox.drain().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let received = page_inbox.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].value, json!("hello"));
        assert_eq!(received[0].origin, ContextId::new("popup"));

        let stats = notifier.stats();
        assert_eq!(stats.scheduled, 5);
        assert_eq!(stats.superseded, 4);
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(notifier.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_timers_are_aborted() {
        let hub = InProcessHub::new();
        let (popup, _popup_inbox) = hub.connect("popup".into());
        let (_page, mut page_inbox) = hub.connect("page".into());
        let notifier = CrossContextNotifier::new(Arc::new(popup), debounce());

        for text in ["a", "ab", "abc"] {
            notifier.schedule("note", json!(text), DebounceClass::FreeText);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Each live timer task holds one clone of the notifier
        assert_eq!(Arc::strong_count(&notifier), 2);
        assert_eq!(notifier.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let received = page_inbox.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].value, json!("abc"));
        assert_eq!(Arc::strong_count(&notifier), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_debounce_independently() {
        let hub = InProcessHub::new();
        let (popup, _popup_inbox) = hub.connect("popup".into());
        let (_page, mut page_inbox) = hub.connect("page".into());
        let notifier = CrossContextNotifier::new(Arc::new(popup), debounce());

        notifier.schedule("enabled", json!(true), DebounceClass::Discrete);
        notifier.schedule("note", json!("draft"), DebounceClass::FreeText);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let early = page_inbox.drain();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].key, "enabled");

        tokio::time::sleep(Duration::from_millis(400)).await;
        let late = page_inbox.drain();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].key, "note");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_target_does_not_block_others() {
        let hub = InProcessHub::new();
        let (popup, _popup_inbox) = hub.connect("popup".into());
        let (_gone, gone_inbox) = hub.connect("closed-tab".into());
        let (_page, mut page_inbox) = hub.connect("page".into());
        drop(gone_inbox);

        let notifier = CrossContextNotifier::new(Arc::new(popup), debounce());
        notifier.schedule("enabled", json!(false), DebounceClass::Discrete);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(page_inbox.drain().len(), 1);
        let stats = notifier.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_peers_is_not_an_error() {
        let hub = InProcessHub::new();
        let (popup, _popup_inbox) = hub.connect("popup".into());
        let notifier = CrossContextNotifier::new(Arc::new(popup), debounce());

        notifier.schedule("k", json!(1), DebounceClass::Discrete);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = notifier.stats();
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.failed, 0);
    }
}
