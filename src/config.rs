//! Synced-state configuration.
//!
//! Debounce windows, store backend selection and the explicit context kind
//! a process may declare at startup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::environment::ContextKind;
use crate::error::ConfigError;
use crate::store::{FileStore, InMemoryStore, PersistentStore};

/// Environment variable naming the context kind of this process.
pub const ENV_CONTEXT_KIND: &str = "SYNCED_STATE_CONTEXT_KIND";
/// Environment variable selecting a file-backed store.
pub const ENV_STORE_PATH: &str = "SYNCED_STATE_STORE_PATH";
/// Environment variable overriding the discrete debounce window (ms).
pub const ENV_DEBOUNCE_DISCRETE_MS: &str = "SYNCED_STATE_DEBOUNCE_DISCRETE_MS";
/// Environment variable overriding the free-text debounce window (ms).
pub const ENV_DEBOUNCE_TEXT_MS: &str = "SYNCED_STATE_DEBOUNCE_TEXT_MS";

/// Configuration for one context's synced-state runtime.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Debounce windows for cross-context broadcasts.
    pub debounce: DebounceConfig,

    /// Durable store backend.
    pub store: StoreConfig,

    /// Context kind declared at process entry. Takes precedence over
    /// capability probing when set.
    pub context_kind: Option<ContextKind>,
}

impl SyncConfig {
    /// Load configuration from `SYNCED_STATE_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(kind) = std::env::var(ENV_CONTEXT_KIND) {
            config.context_kind = Some(kind.parse()?);
        }
        if let Ok(path) = std::env::var(ENV_STORE_PATH) {
            config.store = StoreConfig::File {
                path: PathBuf::from(path),
            };
        }
        if let Some(ms) = read_millis(ENV_DEBOUNCE_DISCRETE_MS)? {
            config.debounce.discrete_ms = ms;
        }
        if let Some(ms) = read_millis(ENV_DEBOUNCE_TEXT_MS)? {
            config.debounce.free_text_ms = ms;
        }

        Ok(config)
    }

    /// Set the declared context kind.
    pub fn context_kind(mut self, kind: ContextKind) -> Self {
        self.context_kind = Some(kind);
        self
    }

    /// Set the debounce configuration.
    pub fn debounce(mut self, debounce: DebounceConfig) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the store configuration.
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

fn read_millis(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                var,
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// How eagerly changes to a key are broadcast to other contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebounceClass {
    /// Booleans, numbers, enumerations: broadcast effectively immediately.
    Discrete,
    /// Free-form text and composite records: wait for typing to settle.
    FreeText,
}

impl DebounceClass {
    /// Pick a class from the JSON shape of a key's default value.
    ///
    /// Enumerations serialize as strings, so keys holding them should
    /// declare [`DebounceClass::Discrete`] explicitly.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) => DebounceClass::Discrete,
            Value::String(_) | Value::Array(_) | Value::Object(_) => DebounceClass::FreeText,
        }
    }
}

/// Debounce windows per [`DebounceClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Window for discrete values (milliseconds).
    pub discrete_ms: u64,

    /// Window for free-text values (milliseconds).
    pub free_text_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            discrete_ms: 0,
            free_text_ms: 500,
        }
    }
}

impl DebounceConfig {
    /// Get the debounce window for a class as a Duration.
    pub fn window_for(&self, class: DebounceClass) -> Duration {
        match class {
            DebounceClass::Discrete => Duration::from_millis(self.discrete_ms),
            DebounceClass::FreeText => Duration::from_millis(self.free_text_ms),
        }
    }
}

/// Durable store configuration.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// Process-local map. Only shared between contexts that share the handle.
    #[default]
    Memory,

    /// Single JSON object file.
    File { path: PathBuf },
}

impl StoreConfig {
    /// Build the configured store.
    pub fn open(&self) -> Arc<dyn PersistentStore> {
        match self {
            StoreConfig::Memory => Arc::new(InMemoryStore::new()),
            StoreConfig::File { path } => Arc::new(FileStore::new(path.clone())),
        }
    }
}
