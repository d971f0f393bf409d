//! Cross-context message passing
//!
//! The notifier sends [`StateChangeMessage`]s through a [`ContextTransport`];
//! receiving contexts hand them to [`SyncContext::deliver_remote`].
//!
//! [`SyncContext::deliver_remote`]: crate::context::SyncContext::deliver_remote

mod hub;

pub use hub::{HubEndpoint, InProcessHub, Inbox};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// Message name for synced-state change notifications.
pub const MSG_GLOBAL_STATE_CHANGE: &str = "global-state-change";

/// Opaque identifier of a live context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A changed value travelling from its originating context to the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeMessage {
    /// Always [`MSG_GLOBAL_STATE_CHANGE`]
    pub name: String,
    pub key: String,
    pub value: Value,
    /// Context that made the change
    pub origin: ContextId,
}

impl StateChangeMessage {
    pub fn new(key: impl Into<String>, value: Value, origin: ContextId) -> Self {
        Self {
            name: MSG_GLOBAL_STATE_CHANGE.to_string(),
            key: key.into(),
            value,
            origin,
        }
    }

    pub fn is_state_change(&self) -> bool {
        self.name == MSG_GLOBAL_STATE_CHANGE
    }
}

/// Best-effort delivery to other live contexts.
#[async_trait]
pub trait ContextTransport: Send + Sync {
    /// Id of the context this transport sends from.
    fn local_id(&self) -> &ContextId;

    /// Currently known targets, excluding the local context.
    async fn peers(&self) -> Vec<ContextId>;

    /// Deliver `message` to `target`. Fails if the target is gone.
    async fn send(
        &self,
        target: &ContextId,
        message: StateChangeMessage,
    ) -> Result<(), TransportError>;
}
