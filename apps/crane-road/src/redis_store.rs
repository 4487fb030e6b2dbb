//! Redis implementation of the coordination store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use crane_sdk::now_millis;
use crane_sdk::store::{
    keys, ExpirationSource, ExpirySubscription, LeaseMutation, LeaseRecord, LeaseStore,
    LockManager, PositionEntry, PositionStore, PresenceRecord, SessionKind, SessionRecord,
    SessionStore, StoreError,
};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Deletes a lock only while it still carries the caller's token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Stamps a heartbeat only on a session hash that still exists.
const TOUCH_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    redis.call("HSET", KEYS[1], "last_heartbeat_at", ARGV[1])
    return 1
end
return 0
"#;

const EXPIRED_CHANNEL: &str = "__keyevent@*__:expired";

fn backend(err: RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[derive(Clone)]
pub struct RedisCoordinationStore {
    client: Client,
    redis: ConnectionManager,
    unlock: Script,
    touch: Script,
}

impl RedisCoordinationStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(backend)?;
        let redis = ConnectionManager::new(client.clone()).await.map_err(backend)?;
        let store = Self {
            client,
            redis,
            unlock: Script::new(UNLOCK_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
        };
        store.enable_expiry_events().await;
        Ok(store)
    }

    /// Expired-key events are off by default. Managed deployments may forbid
    /// CONFIG; then they must be enabled out of band.
    async fn enable_expiry_events(&self) {
        let mut conn = self.redis.clone();
        let result: Result<(), RedisError> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => debug!("keyspace expiry notifications enabled"),
            Err(err) => warn!(error = %err, "could not enable keyspace expiry notifications"),
        }
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn read_session(
        &self,
        conn: &mut ConnectionManager,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let key = keys::session(connection_id);
        let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(backend)?;
        if fields.is_empty() {
            return Ok(None);
        }
        SessionRecord::from_fields(&key, &fields).map(Some)
    }
}

#[async_trait]
impl SessionStore for RedisCoordinationStore {
    async fn put_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let key = keys::session(&session.connection_id);
        let presence_key = keys::presence(session.kind, &session.entity_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, &session.to_fields())
            .ignore()
            .sadd(keys::SESSION_INDEX, &session.connection_id)
            .ignore()
            .hset(&presence_key, "status", "connected")
            .ignore()
            .hset(&presence_key, "connection_id", &session.connection_id)
            .ignore();
        if let Some(name) = &session.display_name {
            pipe.hset(&presence_key, "display_name", name).ignore();
        }
        if let (SessionKind::Operator, Some(crane_id)) = (session.kind, &session.crane_id) {
            pipe.sadd(keys::observers(crane_id), &session.connection_id)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(backend)
    }

    async fn session(&self, connection_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        self.read_session(&mut conn, connection_id).await
    }

    async fn touch_session(&self, connection_id: &str, at: i64) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let touched: i64 = self
            .touch
            .key(keys::session(connection_id))
            .arg(at)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(touched == 1)
    }

    async fn observe_crane(&self, connection_id: &str, crane_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let Some(session) = self.read_session(&mut conn, connection_id).await? else {
            return Ok(());
        };
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(previous) = &session.crane_id {
            pipe.srem(keys::observers(previous), connection_id).ignore();
        }
        pipe.hset(keys::session(connection_id), "crane_id", crane_id)
            .ignore();
        if session.kind == SessionKind::Operator {
            pipe.sadd(keys::observers(crane_id), connection_id).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(backend)
    }

    async fn remove_session(
        &self,
        connection_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let session = match self.read_session(&mut conn, connection_id).await {
            Ok(session) => session,
            Err(StoreError::Malformed { key, reason }) => {
                warn!(%key, %reason, "removing malformed session");
                None
            }
            Err(err) => return Err(err),
        };
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(keys::session(connection_id))
            .ignore()
            .srem(keys::SESSION_INDEX, connection_id)
            .ignore();
        if let Some(session) = &session {
            if let Some(crane_id) = &session.crane_id {
                pipe.srem(keys::observers(crane_id), connection_id).ignore();
            }
            let presence_key = keys::presence(session.kind, &session.entity_id);
            let bound: Option<String> = conn
                .hget(&presence_key, "connection_id")
                .await
                .map_err(backend)?;
            if bound.as_deref() == Some(connection_id) {
                pipe.hset(&presence_key, "status", "offline").ignore();
            }
        }
        pipe.query_async::<()>(&mut conn).await.map_err(backend)?;
        Ok(session)
    }

    async fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        conn.smembers(keys::SESSION_INDEX).await.map_err(backend)
    }

    async fn observers(&self, crane_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let set_key = keys::observers(crane_id);
        let members: Vec<String> = conn.smembers(&set_key).await.map_err(backend)?;
        let mut out = Vec::with_capacity(members.len());
        for connection_id in members {
            match self.read_session(&mut conn, &connection_id).await {
                Ok(Some(session)) => out.push(session),
                Ok(None) => {
                    let _: () = conn
                        .srem(&set_key, &connection_id)
                        .await
                        .map_err(backend)?;
                }
                Err(err) => debug!(connection_id = %connection_id, error = %err, "skipping observer"),
            }
        }
        Ok(out)
    }

    async fn presence(
        &self,
        kind: SessionKind,
        entity_id: &str,
    ) -> Result<Option<PresenceRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(keys::presence(kind, entity_id))
            .await
            .map_err(backend)?;
        Ok(PresenceRecord::from_fields(&fields))
    }
}

#[async_trait]
impl LeaseStore for RedisCoordinationStore {
    async fn lease(&self, crane_id: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let key = keys::lease(crane_id);
        let raw: Option<String> = conn.get(&key).await.map_err(backend)?;
        raw.map(|raw| LeaseRecord::decode(&key, &raw)).transpose()
    }

    async fn leased_crane(&self, holder_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        conn.get(keys::holder(holder_id)).await.map_err(backend)
    }

    async fn apply_lease_batch(&self, batch: &[LeaseMutation]) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
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
                        ttl_ms: millis(*ttl),
                    };
                    let encoded = serde_json::to_string(&record)
                        .map_err(|e| StoreError::Batch(e.to_string()))?;
                    pipe.pset_ex(keys::lease(crane_id), encoded, millis(*ttl))
                        .ignore()
                        .pset_ex(keys::holder(holder_id), crane_id, millis(*ttl))
                        .ignore();
                }
                LeaseMutation::Revoke { crane_id } => {
                    pipe.del(keys::lease(crane_id)).ignore();
                }
                LeaseMutation::ClearHolder { holder_id } => {
                    pipe.del(keys::holder(holder_id)).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Batch(e.to_string()))
    }

    async fn scan_leases(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", keys::LEASE_PREFIX);
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        let mut leases = Vec::with_capacity(found.len());
        for key in found {
            let raw: Option<String> = conn.get(&key).await.map_err(backend)?;
            if let Some(raw) = raw {
                match LeaseRecord::decode(&key, &raw) {
                    Ok(lease) => leases.push(lease),
                    Err(err) => warn!(error = %err, "skipping unreadable lease"),
                }
            }
        }
        Ok(leases)
    }

    async fn claim_expiry(&self, crane_id: &str, window: Duration) -> Result<bool, StoreError> {
        self.set_nx_px(&keys::expiry_claim(crane_id), "1", window).await
    }
}

#[async_trait]
impl LockManager for RedisCoordinationStore {
    async fn try_lock(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.set_nx_px(key, owner_token, ttl).await
    }

    async fn unlock(&self, key: &str, owner_token: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .unlock
            .key(key)
            .arg(owner_token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed == 1)
    }
}

#[async_trait]
impl PositionStore for RedisCoordinationStore {
    async fn put_position(
        &self,
        place_id: &str,
        user_id: &str,
        entry: &PositionEntry,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let encoded = entry.encode()?;
        redis::pipe()
            .atomic()
            .hset(keys::positions(place_id), user_id, encoded)
            .ignore()
            .sadd(keys::POSITION_INDEX, place_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn remove_position(&self, place_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.evict_positions(place_id, &[user_id.to_string()]).await
    }

    async fn position_buckets(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        conn.smembers(keys::POSITION_INDEX).await.map_err(backend)
    }

    async fn raw_positions(&self, place_id: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.redis.clone();
        let entries: HashMap<String, String> = conn
            .hgetall(keys::positions(place_id))
            .await
            .map_err(backend)?;
        Ok(entries.into_iter().collect())
    }

    async fn evict_positions(&self, place_id: &str, user_ids: &[String]) -> Result<(), StoreError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let key = keys::positions(place_id);
        let _: () = conn.hdel(&key, user_ids.to_vec()).await.map_err(backend)?;
        let left: i64 = conn.hlen(&key).await.map_err(backend)?;
        if left == 0 {
            let _: () = conn
                .srem(keys::POSITION_INDEX, place_id)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExpirationSource for RedisCoordinationStore {
    /// Opens a dedicated pub/sub connection that lives until the returned
    /// subscription is closed or dropped.
    async fn subscribe_expirations(&self) -> Result<ExpirySubscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.psubscribe(EXPIRED_CHANNEL).await.map_err(backend)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            warn!("expiry notification stream closed");
                            break;
                        };
                        match message.get_payload::<String>() {
                            Ok(key) => {
                                if tx.send(key).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(error = %err, "unreadable expiry notification"),
                        }
                    }
                }
            }
            debug!("expiry subscription released");
        });
        info!(channel = EXPIRED_CHANNEL, "subscribed to key expirations");
        Ok(ExpirySubscription::new(rx, Some(cancel_tx)))
    }
}
