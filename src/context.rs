//! Per-context runtime.
//!
//! A [`SyncContext`] is built once when a context starts and handed to every
//! cell created in it. It owns the context's local bus, its persistence
//! queue, the notifier (only when the context may originate changes) and
//! the router that hands incoming notifications to bound cells.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{LocalBus, Subscription};
use crate::config::SyncConfig;
use crate::environment::{ContextKind, EnvironmentClassifier, HostCapabilities};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::notifier::CrossContextNotifier;
use crate::store::{spawn_persistence_queue, PersistenceQueue, PersistentStore};
use crate::transport::{ContextId, ContextTransport, Inbox, StateChangeMessage};

/// Shared handle to a context's runtime
pub type SharedContext = Arc<SyncContext>;

/// Synced-state runtime of one execution context.
pub struct SyncContext {
    id: ContextId,
    kind: ContextKind,
    config: SyncConfig,
    bus: Arc<LocalBus>,
    // Fan-out of incoming notifications to the cells bound in this context
    remote: Arc<LocalBus>,
    persistence: PersistenceQueue,
    notifier: Option<Arc<CrossContextNotifier>>,
}

impl SyncContext {
    /// Start building a context over `store`.
    pub fn builder(store: Arc<dyn PersistentStore>) -> SyncContextBuilder {
        SyncContextBuilder {
            store,
            id: None,
            kind: None,
            host: None,
            transport: None,
            config: SyncConfig::default(),
        }
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    pub fn persistence(&self) -> &PersistenceQueue {
        &self.persistence
    }

    /// The notifier, present only when this context originates broadcasts.
    pub fn notifier(&self) -> Option<&Arc<CrossContextNotifier>> {
        self.notifier.as_ref()
    }

    pub fn broadcasts(&self) -> bool {
        self.notifier.is_some()
    }

    pub(crate) fn subscribe_remote<F>(&self, key: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.remote.subscribe(key, handler)
    }

    /// Hand an incoming notification to the cells bound to its key.
    ///
    /// Messages of another type, messages this context sent itself and
    /// messages for keys nobody here is bound to are ignored.
    pub fn deliver_remote(&self, message: StateChangeMessage) {
        if !message.is_state_change() {
            debug!(name = %message.name, "Ignoring unrelated message");
            return;
        }
        if message.origin == self.id {
            debug!(key = %message.key, "Ignoring own notification");
            return;
        }
        if self.remote.subscriber_count(&message.key) == 0 {
            debug!(key = %message.key, origin = %message.origin, "No cell bound for notified key");
            return;
        }

        debug!(key = %message.key, origin = %message.origin, "Applying remote state change");
        self.remote.publish(&message.key, message.value);
    }

    /// Spawn a task delivering every message from `inbox` to this context.
    ///
    /// The task stops when the inbox closes or the context is dropped.
    pub fn listen(self: &Arc<Self>, mut inbox: Inbox) -> JoinHandle<()> {
        let context: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                match context.upgrade() {
                    Some(context) => context.deliver_remote(message),
                    None => break,
                }
            }
            debug!(context = %inbox.id(), "Inbox listener stopped");
        })
    }

    /// Wait until every write issued so far has reached the store.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.persistence.flush().await
    }
}

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
    store: Arc<dyn PersistentStore>,
    id: Option<ContextId>,
    kind: Option<ContextKind>,
    host: Option<Arc<dyn HostCapabilities>>,
    transport: Option<Arc<dyn ContextTransport>>,
    config: SyncConfig,
}

impl SyncContextBuilder {
    /// Context id. Ignored when a transport is set, which carries its own.
    pub fn id(mut self, id: impl Into<ContextId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Declare the context kind explicitly.
    pub fn kind(mut self, kind: ContextKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Host to probe when no kind is declared.
    pub fn host(mut self, host: Arc<dyn HostCapabilities>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ContextTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Classify the context and start its persistence queue.
    ///
    /// Fails when called outside a tokio runtime or when the context
    /// cannot be classified.
    pub fn build(self) -> SyncResult<SharedContext> {
        tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let explicit = self.kind.or(self.config.context_kind);
        let kind = EnvironmentClassifier::new(explicit, self.host).classify()?;

        let id = match (&self.transport, self.id) {
            (Some(transport), Some(id)) if *transport.local_id() != id => {
                warn!(requested = %id, transport = %transport.local_id(), "Using transport context id");
                transport.local_id().clone()
            }
            (Some(transport), _) => transport.local_id().clone(),
            (None, Some(id)) => id,
            (None, None) => ContextId::generate(),
        };

        let notifier = match self.transport {
            Some(transport) if kind.can_originate() => {
                Some(CrossContextNotifier::new(transport, self.config.debounce))
            }
            _ => None,
        };

        let (persistence, _drain) = spawn_persistence_queue(self.store);

        info!(
            context = %id,
            kind = %kind,
            broadcasts = notifier.is_some(),
            "Sync context ready"
        );

        Ok(Arc::new(SyncContext {
            id,
            kind,
            config: self.config,
            bus: LocalBus::new(),
            remote: LocalBus::new(),
            persistence,
            notifier,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::HostSnapshot;
    use crate::error::EnvironmentError;
    use crate::store::InMemoryStore;
    use crate::transport::InProcessHub;
    use serde_json::json;
    use std::sync::Mutex;

    fn store() -> Arc<dyn PersistentStore> {
        Arc::new(InMemoryStore::new())
    }

    #[tokio::test]
    async fn test_only_originating_kinds_get_a_notifier() {
        let hub = InProcessHub::new();
        for kind in ContextKind::ALL {
            let (endpoint, _inbox) = hub.connect(ContextId::new(kind.as_str()));
            let ctx = SyncContext::builder(store())
                .kind(kind)
                .transport(Arc::new(endpoint))
                .build()
                .unwrap();
            assert_eq!(ctx.broadcasts(), kind.can_originate(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_no_transport_means_no_notifier() {
        let ctx = SyncContext::builder(store())
            .kind(ContextKind::InteractiveSurface)
            .build()
            .unwrap();
        assert!(!ctx.broadcasts());
    }

    #[tokio::test]
    async fn test_unclassifiable_context_fails_to_build() {
        let result = SyncContext::builder(store())
            .host(Arc::new(HostSnapshot::default()))
            .build();
        assert!(matches!(
            result,
            Err(SyncError::Environment(EnvironmentError::Unclassified))
        ));
    }

    #[tokio::test]
    async fn test_probed_kind_is_used() {
        let host = HostSnapshot {
            enumerate_views: true,
            background_page: true,
            ..Default::default()
        };
        let ctx = SyncContext::builder(store())
            .host(Arc::new(host))
            .build()
            .unwrap();
        assert_eq!(ctx.kind(), ContextKind::Coordinator);
    }

    #[tokio::test]
    async fn test_transport_id_wins() {
        let hub = InProcessHub::new();
        let (endpoint, _inbox) = hub.connect("popup".into());
        let ctx = SyncContext::builder(store())
            .id("something-else")
            .kind(ContextKind::InteractiveSurface)
            .transport(Arc::new(endpoint))
            .build()
            .unwrap();
        assert_eq!(ctx.id(), &ContextId::new("popup"));
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = SyncContext::builder(store())
            .kind(ContextKind::Coordinator)
            .build();
        assert!(matches!(result, Err(SyncError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_deliver_remote_filters_own_and_foreign_messages() {
        let ctx = SyncContext::builder(store())
            .id("page")
            .kind(ContextKind::EmbeddedPage)
            .build()
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = ctx.subscribe_remote("k", move |v| sink.lock().unwrap().push(v.clone()));

        ctx.deliver_remote(StateChangeMessage::new("k", json!(1), "page".into()));
        let mut foreign = StateChangeMessage::new("k", json!(2), "popup".into());
        foreign.name = "fetch-image".to_string();
        ctx.deliver_remote(foreign);
        ctx.deliver_remote(StateChangeMessage::new("k", json!(3), "popup".into()));

        assert_eq!(*seen.lock().unwrap(), vec![json!(3)]);
    }

    #[tokio::test]
    async fn test_listen_routes_inbox_messages() {
        let hub = InProcessHub::new();
        let (popup, _popup_inbox) = hub.connect("popup".into());
        let (page_endpoint, page_inbox) = hub.connect("page".into());

        let page = SyncContext::builder(store())
            .kind(ContextKind::EmbeddedPage)
            .transport(Arc::new(page_endpoint))
            .build()
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = page.subscribe_remote("k", move |v| {
            let _ = tx.send(v.clone());
        });
        let _listener = page.listen(page_inbox);

        popup
            .send(&"page".into(), StateChangeMessage::new("k", json!("hi"), "popup".into()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(json!("hi")));
    }
}
