//! Synced cells.
//!
//! A [`SyncedCell`] binds one key in one context. It hydrates once from the
//! store, mirrors the context's bus for that key, and on local writes
//! publishes, persists and (in originating contexts) schedules a broadcast.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──hydration──▶ Initialized { initial_notification_skipped } ──drop──▶ TornDown
//!       └────────────────────────────drop─────────────────────────────────────────────▶
//! ```
//!
//! Writes and remote updates only take effect in `Initialized`. Hydration is
//! the first change event an initialized cell sees and it consumes the
//! one-shot skip, so the value loaded from the store is never broadcast.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::Subscription;
use crate::config::DebounceClass;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};

/// Bounds every synced value type satisfies.
pub trait CellValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CellValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellPhase {
    Uninitialized,
    Initialized { initial_notification_skipped: bool },
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOrigin {
    Hydration,
    Local,
}

struct CellState<T> {
    value: T,
    phase: CellPhase,
}

struct CellInner<T> {
    key: String,
    default: T,
    class: DebounceClass,
    ctx: Arc<SyncContext>,
    state: Mutex<CellState<T>>,
    initialized: watch::Sender<bool>,
}

impl<T> CellInner<T> {
    fn lock_state(&self) -> MutexGuard<'_, CellState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_initialized(&self) -> bool {
        matches!(self.lock_state().phase, CellPhase::Initialized { .. })
    }
}

impl<T: CellValue> CellInner<T> {
    /// Bus subscriber: keep the cached value in step with the bus.
    fn on_bus_value(&self, raw: &Value) {
        let value = match serde_json::from_value::<T>(raw.clone()) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Bus value does not decode, ignored");
                return;
            }
        };

        let mut state = self.lock_state();
        if matches!(state.phase, CellPhase::Initialized { .. }) {
            state.value = value;
        }
    }

    /// Remote notification: update the bus like a local write would, but
    /// never hand the value to the notifier.
    fn apply_remote(&self, raw: &Value) {
        if !self.is_initialized() {
            debug!(key = %self.key, "Remote update before hydration dropped");
            return;
        }
        let bus = self.ctx.bus();
        if bus.get(&self.key).as_ref() == Some(raw) {
            return;
        }
        if let Err(e) = serde_json::from_value::<T>(raw.clone()) {
            warn!(key = %self.key, error = %e, "Remote value does not decode, ignored");
            return;
        }
        bus.publish(&self.key, raw.clone());
    }

    fn after_change(&self, raw: Value, origin: ChangeOrigin) {
        let broadcast = {
            let mut state = self.lock_state();
            match state.phase {
                CellPhase::Initialized {
                    initial_notification_skipped: false,
                } => {
                    state.phase = CellPhase::Initialized {
                        initial_notification_skipped: true,
                    };
                    debug!(key = %self.key, ?origin, "Initial notification skipped");
                    false
                }
                CellPhase::Initialized {
                    initial_notification_skipped: true,
                } => origin == ChangeOrigin::Local,
                CellPhase::Uninitialized | CellPhase::TornDown => false,
            }
        };

        if broadcast {
            if let Some(notifier) = self.ctx.notifier() {
                notifier.schedule(&self.key, raw, self.class);
            }
        }
    }
}

async fn hydrate<T: CellValue>(inner: Arc<CellInner<T>>, default_raw: Value) {
    let key = inner.key.as_str();

    let (raw, write_back) = match inner.ctx.persistence().get(key).await {
        Ok(Some(stored)) => match serde_json::from_value::<T>(stored.clone()) {
            Ok(_) => (stored, false),
            Err(e) => {
                warn!(key = %key, error = %e, "Stored value does not decode, using default");
                (default_raw, true)
            }
        },
        Ok(None) => (default_raw, true),
        Err(e) => {
            warn!(key = %key, error = %e, "Hydration read failed, using default");
            (default_raw, false)
        }
    };

    if inner.lock_state().phase == CellPhase::TornDown {
        debug!(key = %key, "Cell torn down before hydration finished");
        return;
    }

    // Another cell in this context may already own the key, and its value
    // can be newer than our read. Only an empty bus is seeded.
    let bus = inner.ctx.bus();
    let persistence = inner.ctx.persistence();
    let seeded = bus.publish_if_absent(key, raw.clone(), || {
        if write_back {
            persistence.enqueue_set(key, raw.clone());
        }
    });

    let current = {
        let mut state = inner.lock_state();
        if state.phase == CellPhase::TornDown {
            return;
        }
        let current = bus.get(key).unwrap_or(raw);
        state.value = match serde_json::from_value::<T>(current.clone()) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Bus value does not decode, using default");
                inner.default.clone()
            }
        };
        state.phase = CellPhase::Initialized {
            initial_notification_skipped: false,
        };
        current
    };

    inner.after_change(current, ChangeOrigin::Hydration);
    inner.initialized.send_replace(true);
    debug!(key = %key, seeded, seeded_default = seeded && write_back, "Cell hydrated");
}

/// Reactive, persisted, cross-context value bound to one key.
///
/// Dropping the cell unsubscribes it; the stored value and other
/// contexts are untouched.
pub struct SyncedCell<T> {
    inner: Arc<CellInner<T>>,
    _local: Subscription,
    _remote: Subscription,
}

impl<T: CellValue> SyncedCell<T> {
    /// Bind `key` with a debounce class inferred from `default`.
    pub fn create(
        ctx: &Arc<SyncContext>,
        key: impl Into<String>,
        default: T,
    ) -> SyncResult<Self> {
        let key = key.into();
        let default_raw = encode(&key, &default)?;
        let class = DebounceClass::infer(&default_raw);
        Self::bind(ctx, key, default, default_raw, class)
    }

    /// Bind `key` with an explicit debounce class.
    pub fn create_with_class(
        ctx: &Arc<SyncContext>,
        key: impl Into<String>,
        default: T,
        class: DebounceClass,
    ) -> SyncResult<Self> {
        let key = key.into();
        let default_raw = encode(&key, &default)?;
        Self::bind(ctx, key, default, default_raw, class)
    }

    fn bind(
        ctx: &Arc<SyncContext>,
        key: String,
        default: T,
        default_raw: Value,
        class: DebounceClass,
    ) -> SyncResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let (initialized, _) = watch::channel(false);
        let inner = Arc::new(CellInner {
            key: key.clone(),
            default: default.clone(),
            class,
            ctx: Arc::clone(ctx),
            state: Mutex::new(CellState {
                value: default,
                phase: CellPhase::Uninitialized,
            }),
            initialized,
        });

        let weak = Arc::downgrade(&inner);
        let local = ctx.bus().subscribe(&key, move |raw| {
            if let Some(inner) = weak.upgrade() {
                inner.on_bus_value(raw);
            }
        });

        let weak = Arc::downgrade(&inner);
        let remote = ctx.subscribe_remote(&key, move |raw| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_remote(raw);
            }
        });

        runtime.spawn(hydrate(Arc::clone(&inner), default_raw));

        Ok(Self {
            inner,
            _local: local,
            _remote: remote,
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn class(&self) -> DebounceClass {
        self.inner.class
    }

    /// Current in-memory value. Before hydration this is the default and
    /// should be treated as provisional.
    pub fn read(&self) -> T {
        self.inner.lock_state().value.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    /// Wait for hydration to finish.
    pub async fn hydrated(&self) {
        let mut ready = self.inner.initialized.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = ready.wait_for(|done| *done).await;
    }

    /// Replace the value. Returns `false` if the write was dropped because
    /// the cell has not hydrated yet.
    pub fn write(&self, value: T) -> bool {
        self.write_with(move |_| value)
    }

    /// Derive the new value from the latest value the bus knows for this
    /// key, not from what this cell last cached, so back-to-back updates
    /// compose. Returns `false` if dropped before hydration.
    pub fn write_with<F>(&self, update: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        let inner = &self.inner;
        if !inner.is_initialized() {
            debug!(key = %inner.key, "Write before hydration dropped");
            return false;
        }

        let bus = inner.ctx.bus();
        let current = bus
            .get(&inner.key)
            .and_then(|raw| serde_json::from_value::<T>(raw).ok())
            .unwrap_or_else(|| inner.default.clone());
        let next = update(&current);

        let raw = match serde_json::to_value(&next) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %inner.key, error = %e, "New value does not encode, write dropped");
                return false;
            }
        };

        bus.publish(&inner.key, raw.clone());
        inner.ctx.persistence().enqueue_set(&inner.key, raw.clone());
        inner.after_change(raw, ChangeOrigin::Local);
        true
    }

    /// Observe every value published for this key in this context.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.ctx.bus().subscribe(&self.inner.key, move |raw| {
            if let Ok(value) = serde_json::from_value::<T>(raw.clone()) {
                callback(&value);
            }
        })
    }

    /// Unbind the cell. Same as dropping it.
    pub fn teardown(self) {
        debug!(key = %self.inner.key, "Cell torn down");
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> SyncResult<Value> {
    serde_json::to_value(value).map_err(|source| SyncError::Codec {
        key: key.to_string(),
        source,
    })
}

impl<T> Drop for SyncedCell<T> {
    fn drop(&mut self) {
        self.inner.lock_state().phase = CellPhase::TornDown;
    }
}

impl<T: fmt::Debug> fmt::Debug for SyncedCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("SyncedCell")
            .field("key", &self.inner.key)
            .field("value", &state.value)
            .field("phase", &state.phase)
            .finish()
    }
}
