//! Durable key/value storage
//!
//! [`PersistentStore`] is the ground truth that survives context restarts.
//! Every context reaches it through its own [`PersistenceQueue`], which keeps
//! that context's reads and writes in submission order.

mod file;
mod memory;
mod queue;

pub use file::FileStore;
pub use memory::InMemoryStore;
pub use queue::{spawn_persistence_queue, PersistStats, PersistenceQueue};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

/// Abstract durable storage for synced values.
///
/// One entry per key, overwrite semantics, atomic per call. No
/// transactions and no batching guarantees.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value stored under `key`.
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}
