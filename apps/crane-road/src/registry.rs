use std::sync::Arc;

use crane_sdk::now_millis;
use crane_sdk::store::{CoordinationStore, SessionKind, SessionRecord, StoreError};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Anything the writer task of one socket can put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event { event: String, data: Value },
    Binary(Vec<u8>),
    Close,
}

impl Outbound {
    pub fn event(event: &str, data: Value) -> Self {
        Outbound::Event {
            event: event.to_string(),
            data,
        }
    }
}

/// Sockets attached to this process. Holds delivery handles only; who a
/// connection belongs to lives in the coordination store.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    senders: Arc<DashMap<String, mpsc::UnboundedSender<Outbound>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(connection_id.to_string(), tx);
        rx
    }

    pub fn detach(&self, connection_id: &str) {
        self.senders.remove(connection_id);
    }

    pub fn is_attached(&self, connection_id: &str) -> bool {
        self.senders.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Best-effort delivery. False when the connection is not attached here
    /// or its writer has gone away.
    pub fn send(&self, connection_id: &str, message: Outbound) -> bool {
        let Some(tx) = self.senders.get(connection_id).map(|s| s.value().clone()) else {
            debug!(connection_id, "no local socket for connection");
            return false;
        };
        tx.send(message).is_ok()
    }

    pub fn broadcast(&self, event: &str, data: &Value) -> usize {
        // Clone the handles first so no map guard is held while sending.
        let targets: Vec<_> = self.senders.iter().map(|e| e.value().clone()).collect();
        targets
            .into_iter()
            .filter(|tx| tx.send(Outbound::event(event, data.clone())).is_ok())
            .count()
    }
}

/// Maps live connections to identities, in the store and in the hub.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<dyn CoordinationStore>,
    hub: ConnectionHub,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, hub: ConnectionHub) -> Self {
        Self { store, hub }
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Record a new session and mark its identity connected.
    pub async fn on_connect(
        &self,
        connection_id: &str,
        kind: SessionKind,
        entity_id: &str,
        display_name: Option<String>,
    ) -> Result<SessionRecord, StoreError> {
        let crane_id = match kind {
            SessionKind::Agent => Some(entity_id.to_string()),
            SessionKind::Operator => None,
        };
        let session = SessionRecord {
            connection_id: connection_id.to_string(),
            kind,
            entity_id: entity_id.to_string(),
            crane_id,
            display_name,
            last_heartbeat_at: now_millis(),
        };
        self.store.put_session(&session).await?;
        debug!(connection_id, entity_id, kind = kind.as_str(), "session recorded");
        Ok(session)
    }

    pub async fn session(&self, connection_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.store.session(connection_id).await
    }

    pub async fn touch(&self, connection_id: &str) -> Result<bool, StoreError> {
        self.store.touch_session(connection_id, now_millis()).await
    }

    pub async fn observe(&self, connection_id: &str, crane_id: &str) -> Result<(), StoreError> {
        self.store.observe_crane(connection_id, crane_id).await
    }

    /// Clear the session and the socket. Returns what was recorded so the
    /// caller can run identity-specific cleanup.
    pub async fn on_disconnect(
        &self,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.hub.detach(connection_id);
        let removed = self.store.remove_session(connection_id).await?;
        if removed.is_none() {
            debug!(connection_id, "no session left to remove");
        }
        Ok(removed)
    }

    /// Deliver to whichever connection the identity is currently bound to.
    pub async fn send_to(
        &self,
        kind: SessionKind,
        entity_id: &str,
        message: Outbound,
    ) -> Result<bool, StoreError> {
        let presence = self.store.presence(kind, entity_id).await?;
        match presence.as_ref().and_then(|p| p.live_connection()) {
            Some(connection_id) => Ok(self.hub.send(connection_id, message)),
            None => Ok(false),
        }
    }

    /// Whether the identity's presence still points at this connection, or at
    /// nothing. False once the identity has reconnected elsewhere.
    pub async fn owns_presence(&self, kind: SessionKind, entity_id: &str, connection_id: &str) -> bool {
        match self.store.presence(kind, entity_id).await {
            Ok(Some(presence)) => presence
                .live_connection()
                .map_or(true, |live| live == connection_id),
            Ok(None) => true,
            Err(err) => {
                warn!(entity_id, error = %err, "presence lookup failed");
                true
            }
        }
    }

    pub async fn display_name(
        &self,
        kind: SessionKind,
        entity_id: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .presence(kind, entity_id)
            .await?
            .and_then(|p| p.display_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crane_sdk::memory::InMemoryCoordinationStore;
    use crane_sdk::store::{PresenceStatus, SessionStore};
    use serde_json::json;

    #[tokio::test]
    async fn connect_and_disconnect_track_presence() {
        let store = InMemoryCoordinationStore::new();
        let registry = ConnectionRegistry::new(store.clone(), ConnectionHub::new());
        let mut rx = registry.hub().attach("c-1");

        registry
            .on_connect("c-1", SessionKind::Operator, "u1", Some("+852".into()))
            .await
            .unwrap();
        let presence = store.presence(SessionKind::Operator, "u1").await.unwrap().unwrap();
        assert_eq!(presence.live_connection(), Some("c-1"));

        assert!(registry
            .send_to(SessionKind::Operator, "u1", Outbound::event("ping", json!(1)))
            .await
            .unwrap());
        assert_eq!(rx.recv().await, Some(Outbound::event("ping", json!(1))));

        let removed = registry.on_disconnect("c-1").await.unwrap().unwrap();
        assert_eq!(removed.entity_id, "u1");
        assert!(!registry.hub().is_attached("c-1"));
        let presence = store.presence(SessionKind::Operator, "u1").await.unwrap().unwrap();
        assert_eq!(presence.status, PresenceStatus::Offline);
        assert!(!registry
            .send_to(SessionKind::Operator, "u1", Outbound::Close)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn presence_follows_the_newest_connection() {
        let store = InMemoryCoordinationStore::new();
        let registry = ConnectionRegistry::new(store, ConnectionHub::new());
        assert!(registry.owns_presence(SessionKind::Operator, "u1", "old").await);

        registry
            .on_connect("old", SessionKind::Operator, "u1", None)
            .await
            .unwrap();
        registry
            .on_connect("new", SessionKind::Operator, "u1", None)
            .await
            .unwrap();
        assert!(!registry.owns_presence(SessionKind::Operator, "u1", "old").await);
        assert!(registry.owns_presence(SessionKind::Operator, "u1", "new").await);
    }

    #[tokio::test]
    async fn agent_session_drives_its_own_crane() {
        let store = InMemoryCoordinationStore::new();
        let registry = ConnectionRegistry::new(store, ConnectionHub::new());
        let session = registry
            .on_connect("c-9", SessionKind::Agent, "crane-9", None)
            .await
            .unwrap();
        assert_eq!(session.crane_id.as_deref(), Some("crane-9"));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_attached_socket() {
        let hub = ConnectionHub::new();
        let mut a = hub.attach("a");
        let mut b = hub.attach("b");
        assert_eq!(hub.broadcast("status-notify", &json!({"x": 1})), 2);
        assert!(matches!(a.recv().await, Some(Outbound::Event { .. })));
        assert!(matches!(b.recv().await, Some(Outbound::Event { .. })));
    }
}
