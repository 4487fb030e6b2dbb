use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Key layout shared by every coordination store backend.
pub mod keys {
    use super::SessionKind;

    /// Prefix of the forward lease keys. Expiration handlers match on it.
    pub const LEASE_PREFIX: &str = "lease:crane:";
    pub const SESSION_INDEX: &str = "sessions";
    pub const POSITION_INDEX: &str = "positions";

    pub fn lease(crane_id: &str) -> String {
        format!("{LEASE_PREFIX}{crane_id}")
    }

    pub fn holder(holder_id: &str) -> String {
        format!("lease:holder:{holder_id}")
    }

    pub fn expiry_claim(crane_id: &str) -> String {
        format!("lease:expired:{crane_id}")
    }

    pub fn lock(operation: &str, crane_id: &str) -> String {
        format!("lock:{operation}:{crane_id}")
    }

    pub fn session(connection_id: &str) -> String {
        format!("session:{connection_id}")
    }

    pub fn presence(kind: SessionKind, entity_id: &str) -> String {
        format!("presence:{}:{entity_id}", kind.as_str())
    }

    pub fn observers(crane_id: &str) -> String {
        format!("observers:{crane_id}")
    }

    pub fn positions(place_id: &str) -> String {
        format!("positions:{place_id}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Operator,
    Agent,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Operator => "operator",
            SessionKind::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "operator" => Some(SessionKind::Operator),
            "agent" => Some(SessionKind::Agent),
            _ => None,
        }
    }
}

/// Bookkeeping for one live socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub connection_id: String,
    pub kind: SessionKind,
    pub entity_id: String,
    /// Operators: the crane they currently observe. Agents: the crane they drive.
    pub crane_id: Option<String>,
    pub display_name: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub last_heartbeat_at: i64,
}

impl SessionRecord {
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("connection_id", self.connection_id.clone()),
            ("kind", self.kind.as_str().to_string()),
            ("entity_id", self.entity_id.clone()),
            ("last_heartbeat_at", self.last_heartbeat_at.to_string()),
        ];
        if let Some(crane_id) = &self.crane_id {
            fields.push(("crane_id", crane_id.clone()));
        }
        if let Some(name) = &self.display_name {
            fields.push(("display_name", name.clone()));
        }
        fields
    }

    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let malformed = |reason: &str| StoreError::Malformed {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let connection_id = fields
            .get("connection_id")
            .cloned()
            .ok_or_else(|| malformed("missing connection_id"))?;
        let kind = fields
            .get("kind")
            .and_then(|k| SessionKind::parse(k))
            .ok_or_else(|| malformed("missing or unknown kind"))?;
        let entity_id = fields
            .get("entity_id")
            .cloned()
            .ok_or_else(|| malformed("missing entity_id"))?;
        let last_heartbeat_at = fields
            .get("last_heartbeat_at")
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| malformed("missing or unparsable last_heartbeat_at"))?;
        Ok(Self {
            connection_id,
            kind,
            entity_id,
            crane_id: fields.get("crane_id").filter(|v| !v.is_empty()).cloned(),
            display_name: fields.get("display_name").filter(|v| !v.is_empty()).cloned(),
            last_heartbeat_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Connected,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Connected => "connected",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Identity-keyed record telling where an operator or agent can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub connection_id: Option<String>,
    pub display_name: Option<String>,
}

impl PresenceRecord {
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let status = match fields.get("status").map(String::as_str) {
            Some("connected") => PresenceStatus::Connected,
            Some("offline") => PresenceStatus::Offline,
            _ => return None,
        };
        Some(Self {
            status,
            connection_id: fields.get("connection_id").filter(|v| !v.is_empty()).cloned(),
            display_name: fields.get("display_name").filter(|v| !v.is_empty()).cloned(),
        })
    }

    /// Connection id, only while the identity is connected.
    pub fn live_connection(&self) -> Option<&str> {
        match self.status {
            PresenceStatus::Connected => self.connection_id.as_deref(),
            PresenceStatus::Offline => None,
        }
    }
}

/// Forward lease entry, stored as JSON under `lease:crane:<crane_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub crane_id: String,
    pub holder_id: String,
    pub acquired_at: i64,
    pub ttl_ms: u64,
}

impl LeaseRecord {
    pub fn decode(key: &str, raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// One step of an atomic lease batch. Forward and reverse entries only ever
/// change through these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseMutation {
    /// Write `crane -> holder` and `holder -> crane` with the same TTL.
    Grant {
        crane_id: String,
        holder_id: String,
        ttl: Duration,
    },
    /// Delete the forward entry of a crane.
    Revoke { crane_id: String },
    /// Delete the reverse entry of a holder.
    ClearHolder { holder_id: String },
}

/// Advisory telemetry for one operator inside a place bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub location: serde_json::Value,
    #[serde(default)]
    pub last_heartbeat_at: Option<i64>,
}

impl PositionEntry {
    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(String),
    #[error("malformed record at {key}: {reason}")]
    Malformed { key: String, reason: String },
    #[error("batch rejected: {0}")]
    Batch(String),
}

/// Stream of expired key names, kept alive until closed or dropped.
pub struct ExpirySubscription {
    events: mpsc::UnboundedReceiver<String>,
    cancel: Option<oneshot::Sender<()>>,
}

impl ExpirySubscription {
    pub fn new(events: mpsc::UnboundedReceiver<String>, cancel: Option<oneshot::Sender<()>>) -> Self {
        Self { events, cancel }
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.events.close();
    }
}

impl Drop for ExpirySubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record a session plus its presence entry, and its observer membership.
    async fn put_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    async fn session(&self, connection_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Refresh `last_heartbeat_at`. Returns false when the session is gone.
    async fn touch_session(&self, connection_id: &str, at: i64) -> Result<bool, StoreError>;

    /// Move an operator session's observing crane.
    async fn observe_crane(&self, connection_id: &str, crane_id: &str) -> Result<(), StoreError>;

    /// Delete a session, drop it from indexes and mark its presence offline
    /// when the presence still points at this connection.
    async fn remove_session(&self, connection_id: &str)
    -> Result<Option<SessionRecord>, StoreError>;

    async fn session_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Operator sessions whose observing crane is `crane_id`.
    async fn observers(&self, crane_id: &str) -> Result<Vec<SessionRecord>, StoreError>;

    async fn presence(
        &self,
        kind: SessionKind,
        entity_id: &str,
    ) -> Result<Option<PresenceRecord>, StoreError>;
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn lease(&self, crane_id: &str) -> Result<Option<LeaseRecord>, StoreError>;

    /// Reverse index lookup.
    async fn leased_crane(&self, holder_id: &str) -> Result<Option<String>, StoreError>;

    /// Apply every mutation or none of them.
    async fn apply_lease_batch(&self, batch: &[LeaseMutation]) -> Result<(), StoreError>;

    /// Linear scan over forward entries. Diagnostics only.
    async fn scan_leases(&self) -> Result<Vec<LeaseRecord>, StoreError>;

    /// Set-if-absent marker used to handle one lease expiry exactly once.
    async fn claim_expiry(&self, crane_id: &str, window: Duration) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Set `key` to `owner_token` only if absent.
    async fn try_lock(&self, key: &str, owner_token: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Delete `key` only if it still holds `owner_token`.
    async fn unlock(&self, key: &str, owner_token: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn put_position(
        &self,
        place_id: &str,
        user_id: &str,
        entry: &PositionEntry,
    ) -> Result<(), StoreError>;

    async fn remove_position(&self, place_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn position_buckets(&self) -> Result<Vec<String>, StoreError>;

    /// Raw `(user_id, json)` pairs so callers can decide what is malformed.
    async fn raw_positions(&self, place_id: &str) -> Result<Vec<(String, String)>, StoreError>;

    async fn evict_positions(&self, place_id: &str, user_ids: &[String]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ExpirationSource: Send + Sync {
    async fn subscribe_expirations(&self) -> Result<ExpirySubscription, StoreError>;
}

/// Everything the broker needs from its shared coordination store.
pub trait CoordinationStore:
    SessionStore + LeaseStore + LockManager + PositionStore + ExpirationSource
{
}

impl<T> CoordinationStore for T where
    T: SessionStore + LeaseStore + LockManager + PositionStore + ExpirationSource
{
}
