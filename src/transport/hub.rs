//! In-process transport
//!
//! Routes messages between contexts that live in one process, each with its
//! own inbox. Used by the simulator and the tests; a browser host would
//! implement [`ContextTransport`] over its own runtime messaging instead.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ContextId, ContextTransport, StateChangeMessage};
use crate::error::TransportError;

type Routes = BTreeMap<ContextId, mpsc::UnboundedSender<StateChangeMessage>>;

/// Router shared by every in-process context.
#[derive(Clone, Default)]
pub struct InProcessHub {
    routes: Arc<Mutex<Routes>>,
}

impl InProcessHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` and return its sending endpoint and inbox.
    ///
    /// Connecting an id twice replaces the earlier inbox.
    pub fn connect(&self, id: ContextId) -> (HubEndpoint, Inbox) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.routes().insert(id.clone(), sender);
        debug!(context = %id, "Context connected to hub");

        let endpoint = HubEndpoint {
            id: id.clone(),
            hub: self.clone(),
        };
        (endpoint, Inbox { id, receiver })
    }

    /// Forget `id`. Later sends to it fail.
    pub fn disconnect(&self, id: &ContextId) {
        if self.routes().remove(id).is_some() {
            debug!(context = %id, "Context disconnected from hub");
        }
    }

    /// Ids of every registered context
    pub fn contexts(&self) -> Vec<ContextId> {
        self.routes().keys().cloned().collect()
    }
}

/// One context's view of the hub.
#[derive(Clone)]
pub struct HubEndpoint {
    id: ContextId,
    hub: InProcessHub,
}

#[async_trait]
impl ContextTransport for HubEndpoint {
    fn local_id(&self) -> &ContextId {
        &self.id
    }

    async fn peers(&self) -> Vec<ContextId> {
        self.hub
            .routes()
            .keys()
            .filter(|id| **id != self.id)
            .cloned()
            .collect()
    }

    async fn send(
        &self,
        target: &ContextId,
        message: StateChangeMessage,
    ) -> Result<(), TransportError> {
        if *target == self.id {
            return Err(TransportError::Rejected {
                target: target.clone(),
                reason: "a context never messages itself".to_string(),
            });
        }

        let sender = self
            .hub
            .routes()
            .get(target)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(target.clone()))?;

        sender
            .send(message)
            .map_err(|_| TransportError::Unreachable(target.clone()))
    }
}

/// Receiving side of a hub connection.
pub struct Inbox {
    id: ContextId,
    receiver: mpsc::UnboundedReceiver<StateChangeMessage>,
}

impl Inbox {
    pub fn id(&self) -> &ContextId {
        &self.id
    }

    /// Wait for the next message. `None` once the hub side is gone.
    pub async fn recv(&mut self) -> Option<StateChangeMessage> {
        self.receiver.recv().await
    }

    /// Next message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<StateChangeMessage> {
        self.receiver.try_recv().ok()
    }

    /// Drain everything currently waiting.
    pub fn drain(&mut self) -> Vec<StateChangeMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.try_recv() {
            messages.push(message);
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_peers_exclude_self() {
        let hub = InProcessHub::new();
        let (a, _a_inbox) = hub.connect("a".into());
        let (_b, _b_inbox) = hub.connect("b".into());
        let (_c, _c_inbox) = hub.connect("c".into());

        let peers = a.peers().await;
        assert_eq!(peers, vec![ContextId::new("b"), ContextId::new("c")]);
    }

    #[tokio::test]
    async fn test_send_delivers_to_inbox() {
        let hub = InProcessHub::new();
        let (a, _a_inbox) = hub.connect("a".into());
        let (_b, mut b_inbox) = hub.connect("b".into());

        let message = StateChangeMessage::new("k", json!(1), a.local_id().clone());
        a.send(&"b".into(), message.clone()).await.unwrap();

        assert_eq!(b_inbox.recv().await, Some(message));
    }

    #[tokio::test]
    async fn test_send_to_closed_inbox_fails() {
        let hub = InProcessHub::new();
        let (a, _a_inbox) = hub.connect("a".into());
        let (_b, b_inbox) = hub.connect("b".into());
        drop(b_inbox);

        let message = StateChangeMessage::new("k", json!(1), a.local_id().clone());
        let err = a.send(&"b".into(), message).await.unwrap_err();
        assert_eq!(err, TransportError::Unreachable("b".into()));
    }

    #[tokio::test]
    async fn test_send_to_self_is_rejected() {
        let hub = InProcessHub::new();
        let (a, mut a_inbox) = hub.connect("a".into());

        let message = StateChangeMessage::new("k", json!(1), a.local_id().clone());
        let err = a.send(&"a".into(), message).await.unwrap_err();

        assert!(matches!(err, TransportError::Rejected { ref target, .. } if *target == ContextId::new("a")));
        assert!(a_inbox.drain().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_context_is_not_a_peer() {
        let hub = InProcessHub::new();
        let (a, _a_inbox) = hub.connect("a".into());
        let (_b, _b_inbox) = hub.connect("b".into());

        hub.disconnect(&"b".into());
        assert!(a.peers().await.is_empty());
        assert_eq!(hub.contexts(), vec![ContextId::new("a")]);
    }
}
