//! In-memory coordination store.
//!
//! Models the subset of a Redis keyspace the broker relies on (strings,
//! hashes, sets, per-key TTLs and expiry notifications) behind one mutex, so
//! every batch is atomic exactly like a MULTI/EXEC pipeline. Used by tests
//! and as the single-process fallback when no Redis URL is configured.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::now_millis;
use crate::store::{
    keys, ExpirationSource, ExpirySubscription, LeaseMutation, LeaseRecord, LeaseStore,
    LockManager, PositionEntry, PositionStore, PresenceRecord, SessionKind, SessionRecord,
    SessionStore, StoreError,
};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    expired: Vec<String>,
}

impl Keyspace {
    fn reap(&mut self, key: &str) {
        let now = Instant::now();
        let stale = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if stale {
            self.entries.remove(key);
            self.expired.push(key.to_string());
        }
    }

    fn reap_all(&mut self) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.entries.remove(&key);
            self.expired.push(key);
        }
    }

    fn get_str(&mut self, key: &str) -> Option<String> {
        self.reap(key);
        match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn set_str(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn set_nx(&mut self, key: &str, value: String, ttl: Duration) -> bool {
        self.reap(key);
        if self.entries.contains_key(key) {
            return false;
        }
        self.set_str(key, value, Some(ttl));
        true
    }

    fn del(&mut self, key: &str) -> bool {
        self.reap(key);
        self.entries.remove(key).is_some()
    }

    fn hash(&mut self, key: &str) -> Option<HashMap<String, String>> {
        self.reap(key);
        match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => Some(h.clone()),
            _ => None,
        }
    }

    fn hash_mut(&mut self, key: &str) -> &mut HashMap<String, String> {
        self.reap(key);
        let entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if !matches!(entry.value, Value::Hash(_)) {
            entry.value = Value::Hash(HashMap::new());
        }
        match &mut entry.value {
            Value::Hash(h) => h,
            _ => unreachable!("entry was just coerced to a hash"),
        }
    }

    fn hdel(&mut self, key: &str, field: &str) {
        let emptied = {
            let hash = self.hash_mut(key);
            hash.remove(field);
            hash.is_empty()
        };
        if emptied {
            self.entries.remove(key);
        }
    }

    fn set_mut(&mut self, key: &str) -> &mut BTreeSet<String> {
        self.reap(key);
        let entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        if !matches!(entry.value, Value::Set(_)) {
            entry.value = Value::Set(BTreeSet::new());
        }
        match &mut entry.value {
            Value::Set(s) => s,
            _ => unreachable!("entry was just coerced to a set"),
        }
    }

    fn members(&mut self, key: &str) -> Vec<String> {
        self.reap(key);
        match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Set(s)) => s.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn srem(&mut self, key: &str, member: &str) {
        let emptied = {
            let set = self.set_mut(key);
            set.remove(member);
            set.is_empty()
        };
        if emptied {
            self.entries.remove(key);
        }
    }

    fn session(&mut self, connection_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let key = keys::session(connection_id);
        match self.hash(&key) {
            Some(fields) => SessionRecord::from_fields(&key, &fields).map(Some),
            None => Ok(None),
        }
    }
}

/// Redis-shaped coordination store living in process memory.
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    keyspace: Mutex<Keyspace>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    fail_next_batch: AtomicBool,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next lease batch fail before touching any key.
    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    /// Expire every key whose TTL has lapsed and notify subscribers.
    pub async fn purge_expired(&self) -> usize {
        let expired = {
            let mut ks = self.keyspace.lock().await;
            ks.reap_all();
            std::mem::take(&mut ks.expired)
        };
        let count = expired.len();
        for key in expired {
            self.publish_expired(&key).await;
        }
        count
    }

    /// Deliver an expiry notification for `key`, whether or not it existed.
    pub async fn publish_expired(&self, key: &str) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(key.to_string()).is_ok());
        debug!(key, receivers = subscribers.len(), "published key expiry");
    }

    /// Write raw hash fields, bypassing record validation.
    pub async fn put_raw_hash(&self, key: &str, fields: &[(&str, &str)]) {
        let mut ks = self.keyspace.lock().await;
        let hash = ks.hash_mut(key);
        for (field, value) in fields {
            hash.insert(field.to_string(), value.to_string());
        }
    }

    /// Add a member to a raw set, bypassing record validation.
    pub async fn add_raw_member(&self, key: &str, member: &str) {
        self.keyspace.lock().await.set_mut(key).insert(member.to_string());
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let mut ks = self.keyspace.lock().await;
        ks.reap(key);
        ks.entries.contains_key(key)
    }

    /// Background task that reaps expired keys, standing in for Redis'
    /// active expiry cycle.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                store.purge_expired().await;
            }
        })
    }

    async fn flush_lazy_expiries(&self) {
        let expired = std::mem::take(&mut self.keyspace.lock().await.expired);
        for key in expired {
            self.publish_expired(&key).await;
        }
    }
}

#[async_trait]
impl SessionStore for InMemoryCoordinationStore {
    async fn put_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        {
            let mut ks = self.keyspace.lock().await;
            let key = keys::session(&session.connection_id);
            let hash = ks.hash_mut(&key);
            hash.clear();
            for (field, value) in session.to_fields() {
                hash.insert(field.to_string(), value);
            }
            ks.set_mut(keys::SESSION_INDEX)
                .insert(session.connection_id.clone());
            let presence = ks.hash_mut(&keys::presence(session.kind, &session.entity_id));
            presence.insert("status".into(), "connected".into());
            presence.insert("connection_id".into(), session.connection_id.clone());
            if let Some(name) = &session.display_name {
                presence.insert("display_name".into(), name.clone());
            }
            if let (SessionKind::Operator, Some(crane_id)) = (session.kind, &session.crane_id) {
                ks.set_mut(&keys::observers(crane_id))
                    .insert(session.connection_id.clone());
            }
        }
        self.flush_lazy_expiries().await;
        Ok(())
    }

    async fn session(&self, connection_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let result = self.keyspace.lock().await.session(connection_id);
        self.flush_lazy_expiries().await;
        result
    }

    async fn touch_session(&self, connection_id: &str, at: i64) -> Result<bool, StoreError> {
        let mut ks = self.keyspace.lock().await;
        let key = keys::session(connection_id);
        if ks.hash(&key).is_none() {
            return Ok(false);
        }
        ks.hash_mut(&key)
            .insert("last_heartbeat_at".into(), at.to_string());
        Ok(true)
    }

    async fn observe_crane(&self, connection_id: &str, crane_id: &str) -> Result<(), StoreError> {
        let mut ks = self.keyspace.lock().await;
        let Some(session) = ks.session(connection_id)? else {
            return Ok(());
        };
        if let Some(previous) = &session.crane_id {
            ks.srem(&keys::observers(previous), connection_id);
        }
        ks.hash_mut(&keys::session(connection_id))
            .insert("crane_id".into(), crane_id.to_string());
        if session.kind == SessionKind::Operator {
            ks.set_mut(&keys::observers(crane_id))
                .insert(connection_id.to_string());
        }
        Ok(())
    }

    async fn remove_session(
        &self,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let mut ks = self.keyspace.lock().await;
        let key = keys::session(connection_id);
        let session = match ks.hash(&key) {
            Some(fields) => SessionRecord::from_fields(&key, &fields).ok(),
            None => None,
        };
        ks.del(&key);
        ks.srem(keys::SESSION_INDEX, connection_id);
        if let Some(session) = &session {
            if let Some(crane_id) = &session.crane_id {
                ks.srem(&keys::observers(crane_id), connection_id);
            }
            let presence_key = keys::presence(session.kind, &session.entity_id);
            let owned = ks
                .hash(&presence_key)
                .and_then(|p| p.get("connection_id").cloned())
                .is_some_and(|c| c == connection_id);
            if owned {
                ks.hash_mut(&presence_key)
                    .insert("status".into(), "offline".into());
            }
        }
        Ok(session)
    }

    async fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.keyspace.lock().await.members(keys::SESSION_INDEX))
    }

    async fn observers(&self, crane_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut ks = self.keyspace.lock().await;
        let mut out = Vec::new();
        for connection_id in ks.members(&keys::observers(crane_id)) {
            if let Ok(Some(session)) = ks.session(&connection_id) {
                out.push(session);
            }
        }
        Ok(out)
    }

    async fn presence(
        &self,
        kind: SessionKind,
        entity_id: &str,
    ) -> Result<Option<PresenceRecord>, StoreError> {
        let mut ks = self.keyspace.lock().await;
        Ok(ks
            .hash(&keys::presence(kind, entity_id))
            .and_then(|fields| PresenceRecord::from_fields(&fields)))
    }
}

#[async_trait]
impl LeaseStore for InMemoryCoordinationStore {
    async fn lease(&self, crane_id: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let key = keys::lease(crane_id);
        let raw = self.keyspace.lock().await.get_str(&key);
        self.flush_lazy_expiries().await;
        raw.map(|raw| LeaseRecord::decode(&key, &raw)).transpose()
    }

    async fn leased_crane(&self, holder_id: &str) -> Result<Option<String>, StoreError> {
        let crane = self.keyspace.lock().await.get_str(&keys::holder(holder_id));
        self.flush_lazy_expiries().await;
        Ok(crane.filter(|c| !c.is_empty()))
    }

    async fn apply_lease_batch(&self, batch: &[LeaseMutation]) -> Result<(), StoreError> {
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Batch("injected failure".into()));
        }
        let mut ks = self.keyspace.lock().await;
        for mutation in batch {
            match mutation {
                LeaseMutation::Grant {
                    crane_id,
                    holder_id,
                    ttl,
                } => {
                    let record = LeaseRecord {
                        crane_id: crane_id.clone(),
                        holder_id: holder_id.clone(),
                        acquired_at: now_millis(),
                        ttl_ms: ttl.as_millis() as u64,
                    };
                    let encoded = serde_json::to_string(&record)
                        .map_err(|e| StoreError::Batch(e.to_string()))?;
                    ks.set_str(&keys::lease(crane_id), encoded, Some(*ttl));
                    ks.set_str(&keys::holder(holder_id), crane_id.clone(), Some(*ttl));
                }
                LeaseMutation::Revoke { crane_id } => {
                    ks.del(&keys::lease(crane_id));
                }
                LeaseMutation::ClearHolder { holder_id } => {
                    ks.del(&keys::holder(holder_id));
                }
            }
        }
        Ok(())
    }

    async fn scan_leases(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        let mut ks = self.keyspace.lock().await;
        ks.reap_all();
        let mut out = Vec::new();
        for (key, entry) in ks.entries.iter() {
            if let (true, Value::Str(raw)) = (key.starts_with(keys::LEASE_PREFIX), &entry.value) {
                out.push(LeaseRecord::decode(key, raw)?);
            }
        }
        out.sort_by(|a, b| a.crane_id.cmp(&b.crane_id));
        Ok(out)
    }

    async fn claim_expiry(&self, crane_id: &str, window: Duration) -> Result<bool, StoreError> {
        let mut ks = self.keyspace.lock().await;
        Ok(ks.set_nx(&keys::expiry_claim(crane_id), "1".into(), window))
    }
}

#[async_trait]
impl LockManager for InMemoryCoordinationStore {
    async fn try_lock(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self
            .keyspace
            .lock()
            .await
            .set_nx(key, owner_token.to_string(), ttl))
    }

    async fn unlock(&self, key: &str, owner_token: &str) -> Result<bool, StoreError> {
        let mut ks = self.keyspace.lock().await;
        if ks.get_str(key).as_deref() == Some(owner_token) {
            Ok(ks.del(key))
        } else {
            Ok(false)
        }
    }
}

#[async_trait]
impl PositionStore for InMemoryCoordinationStore {
    async fn put_position(
        &self,
        place_id: &str,
        user_id: &str,
        entry: &PositionEntry,
    ) -> Result<(), StoreError> {
        let encoded = entry.encode()?;
        let mut ks = self.keyspace.lock().await;
        ks.hash_mut(&keys::positions(place_id))
            .insert(user_id.to_string(), encoded);
        ks.set_mut(keys::POSITION_INDEX).insert(place_id.to_string());
        Ok(())
    }

    async fn remove_position(&self, place_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.keyspace
            .lock()
            .await
            .hdel(&keys::positions(place_id), user_id);
        Ok(())
    }

    async fn position_buckets(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.keyspace.lock().await.members(keys::POSITION_INDEX))
    }

    async fn raw_positions(&self, place_id: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut ks = self.keyspace.lock().await;
        let mut out: Vec<(String, String)> = ks
            .hash(&keys::positions(place_id))
            .map(|h| h.into_iter().collect())
            .unwrap_or_default();
        out.sort();
        Ok(out)
    }

    async fn evict_positions(&self, place_id: &str, user_ids: &[String]) -> Result<(), StoreError> {
        let mut ks = self.keyspace.lock().await;
        let key = keys::positions(place_id);
        for user_id in user_ids {
            ks.hdel(&key, user_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ExpirationSource for InMemoryCoordinationStore {
    async fn subscribe_expirations(&self) -> Result<ExpirySubscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        Ok(ExpirySubscription::new(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(crane: &str, holder: &str, ttl: Duration) -> LeaseMutation {
        LeaseMutation::Grant {
            crane_id: crane.into(),
            holder_id: holder.into(),
            ttl,
        }
    }

    #[tokio::test]
    async fn grant_writes_both_directions() {
        let store = InMemoryCoordinationStore::new();
        store
            .apply_lease_batch(&[grant("crane-1", "u1", Duration::from_secs(60))])
            .await
            .unwrap();
        let lease = store.lease("crane-1").await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "u1");
        assert_eq!(lease.ttl_ms, 60_000);
        assert_eq!(
            store.leased_crane("u1").await.unwrap().as_deref(),
            Some("crane-1")
        );
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_state() {
        let store = InMemoryCoordinationStore::new();
        store.fail_next_batch();
        let err = store
            .apply_lease_batch(&[grant("crane-1", "u1", Duration::from_secs(60))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Batch(_)));
        assert!(store.lease("crane-1").await.unwrap().is_none());
        assert!(store.leased_crane("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_keys_are_published() {
        let store = InMemoryCoordinationStore::new();
        let mut sub = store.subscribe_expirations().await.unwrap();
        store
            .apply_lease_batch(&[grant("crane-7", "u1", Duration::from_millis(20))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.purge_expired().await, 2);
        let mut seen = vec![sub.recv().await.unwrap(), sub.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["lease:crane:crane-7", "lease:holder:u1"]);
    }

    #[tokio::test]
    async fn lock_is_set_if_absent_and_owner_checked() {
        let store = InMemoryCoordinationStore::new();
        let ttl = Duration::from_secs(5);
        assert!(store.try_lock("lock:lease:c1", "a", ttl).await.unwrap());
        assert!(!store.try_lock("lock:lease:c1", "b", ttl).await.unwrap());
        assert!(!store.unlock("lock:lease:c1", "b").await.unwrap());
        assert!(store.unlock("lock:lease:c1", "a").await.unwrap());
        assert!(store.try_lock("lock:lease:c1", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn removing_session_marks_presence_offline_and_drops_observer() {
        let store = InMemoryCoordinationStore::new();
        let session = SessionRecord {
            connection_id: "c-1".into(),
            kind: SessionKind::Operator,
            entity_id: "u1".into(),
            crane_id: Some("crane-1".into()),
            display_name: Some("op".into()),
            last_heartbeat_at: now_millis(),
        };
        store.put_session(&session).await.unwrap();
        assert_eq!(store.observers("crane-1").await.unwrap().len(), 1);

        let removed = store.remove_session("c-1").await.unwrap();
        assert_eq!(removed, Some(session));
        assert!(store.observers("crane-1").await.unwrap().is_empty());
        let presence = store
            .presence(SessionKind::Operator, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(presence.live_connection(), None);
        assert!(store.session_ids().await.unwrap().is_empty());
    }
}
