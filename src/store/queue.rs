//! Ordered persistence queue.
//!
//! Each context talks to the shared [`PersistentStore`] through one queue
//! drained by a single background task. This gives the context two
//! properties the raw store does not:
//!
//! - Writes to the same key land in the order they were issued, even though
//!   callers fire and forget them.
//! - A hydration read enqueued after a write observes that write.
//!
//! `enqueue_set` never blocks and never fails. A failed store write is
//! logged and counted; the in-memory value that triggered it stays applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::PersistentStore;
use crate::error::StoreError;

enum Command {
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<Value>, StoreError>>,
    },
    Set {
        key: String,
        value: Value,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
}

/// Persistence statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    /// Writes acknowledged by the store
    pub written: u64,
    /// Writes the store rejected
    pub failed: u64,
}

/// Handle for submitting reads and writes to the drain task.
#[derive(Clone)]
pub struct PersistenceQueue {
    sender: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
}

/// Spawn the drain task for `store` and return a handle to its queue.
///
/// The task exits once every [`PersistenceQueue`] clone has been dropped
/// and the remaining commands are processed.
pub fn spawn_persistence_queue(
    store: Arc<dyn PersistentStore>,
) -> (PersistenceQueue, tokio::task::JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    let handle = tokio::spawn(drain(store, receiver, counters.clone()));
    (PersistenceQueue { sender, counters }, handle)
}

async fn drain(
    store: Arc<dyn PersistentStore>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    counters: Arc<Counters>,
) {
    info!("Persistence queue started");

    while let Some(command) = receiver.recv().await {
        match command {
            Command::Get { key, reply } => {
                let result = store.get(&key).await;
                // Requester may have gone away (cell torn down); nothing to do
                let _ = reply.send(result);
            }
            Command::Set { key, value } => match store.set(&key, value).await {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Persisted value");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Persisting value failed (in-memory value kept)");
                }
            },
            Command::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    info!("Persistence queue stopped");
}

impl PersistenceQueue {
    /// Read `key` after every previously enqueued command has run.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::Get {
                key: key.to_string(),
                reply,
            })
            .map_err(|_| StoreError::QueueClosed)?;
        response.await.map_err(|_| StoreError::QueueClosed)?
    }

    /// Enqueue a write. Fire-and-forget.
    pub fn enqueue_set(&self, key: &str, value: Value) {
        let command = Command::Set {
            key: key.to_string(),
            value,
        };
        if self.sender.send(command).is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "Persistence queue closed, write dropped");
        }
    }

    /// Wait until every command enqueued before this call has been handled.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply, done) = oneshot::channel();
        self.sender
            .send(Command::Flush { reply })
            .map_err(|_| StoreError::QueueClosed)?;
        done.await.map_err(|_| StoreError::QueueClosed)
    }

    /// Get current stats.
    pub fn stats(&self) -> PersistStats {
        PersistStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
