//! Synced State - cross-context reactive configuration
//!
//! Several isolated execution contexts (a popup panel, scripts embedded in
//! host pages, a background coordinator, a settings page) share a handful of
//! mutable configuration values without sharing memory.
//!
//! ## Architecture
//!
//! ```text
//! SyncedCell::write ─▶ LocalBus (sync fan-out, same context)
//!                  ├─▶ PersistenceQueue ─▶ PersistentStore (async, ordered)
//!                  └─▶ CrossContextNotifier (debounced, originating contexts only)
//!                            └─▶ ContextTransport ─▶ SyncContext::deliver_remote
//!                                                      └─▶ remote cell ─▶ its LocalBus
//! ```
//!
//! Convergence across contexts is eventual and last-write-wins. Within a
//! context a read right after a write always sees the write.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use synced_state::{ContextKind, InMemoryStore, SyncContext, SyncedCell};
//!
//! # async fn demo() -> Result<(), synced_state::SyncError> {
//! let ctx = SyncContext::builder(Arc::new(InMemoryStore::new()))
//!     .kind(ContextKind::SettingsSurface)
//!     .build()?;
//!
//! let counter = SyncedCell::create(&ctx, "counter", 0u32)?;
//! counter.hydrated().await;
//! counter.write_with(|c| c + 1);
//! assert_eq!(counter.read(), 1);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cell;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod notifier;
pub mod prompt_contexts;
pub mod schema;
pub mod store;
pub mod transport;

pub use bus::{LocalBus, Subscription};
pub use cell::{CellValue, SyncedCell};
pub use config::{DebounceClass, DebounceConfig, StoreConfig, SyncConfig};
pub use context::{SharedContext, SyncContext, SyncContextBuilder};
pub use environment::{ContextKind, EnvironmentClassifier, HostCapabilities, HostSnapshot};
pub use error::{ConfigError, EnvironmentError, StoreError, SyncError, SyncResult, TransportError};
pub use notifier::{CrossContextNotifier, NotifierStats};
pub use prompt_contexts::{ContextFile, PromptContext, PromptContexts};
pub use schema::{KeySpec, PluginConfig, SCHEMA_VERSION};
pub use store::{FileStore, InMemoryStore, PersistenceQueue, PersistentStore};
pub use transport::{
    ContextId, ContextTransport, HubEndpoint, InProcessHub, Inbox, StateChangeMessage,
    MSG_GLOBAL_STATE_CHANGE,
};
