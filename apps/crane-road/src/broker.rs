//! Shared broker state and the per-event handlers behind the websocket.

use std::sync::Arc;

use crane_sdk::now_millis;
use crane_sdk::protocol::{events, Reply, StatusEnvelope};
use crane_sdk::store::{CoordinationStore, PositionEntry, SessionKind, StoreError};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::CredentialVerifier;
use crate::config::BrokerConfig;
use crate::directory::{AgentDirectory, AgentRegistration, AgentStatus};
use crate::expiration::{ExpirationWatcher, LeaseExpiryHandler};
use crate::heartbeat::HeartbeatMonitor;
use crate::lease::ControlArbiter;
use crate::lock::{LockPolicy, Locker};
use crate::registry::{ConnectionHub, ConnectionRegistry, Outbound};
use crate::relay::MessageRelay;
use crate::signaling::{AgentRegister, ClientEvent, LocationQuery, LocationUpdate};
use crate::status::StatusBroadcaster;

/// Who is on the other end of one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRole {
    Operator { user_id: String },
    /// `crane_id` is known once the agent has registered.
    Agent { crane_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub connection_id: String,
    pub role: PeerRole,
}

impl Peer {
    pub fn operator(user_id: &str) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            role: PeerRole::Operator {
                user_id: user_id.to_string(),
            },
        }
    }

    pub fn agent() -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            role: PeerRole::Agent { crane_id: None },
        }
    }
}

pub struct Broker {
    config: BrokerConfig,
    store: Arc<dyn CoordinationStore>,
    registry: ConnectionRegistry,
    broadcaster: StatusBroadcaster,
    arbiter: Arc<ControlArbiter>,
    relay: MessageRelay,
    directory: Arc<dyn AgentDirectory>,
    verifier: Arc<dyn CredentialVerifier>,
    watcher: ExpirationWatcher,
    monitor: Arc<HeartbeatMonitor>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn CoordinationStore>,
        directory: Arc<dyn AgentDirectory>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Arc<Self> {
        let registry = ConnectionRegistry::new(Arc::clone(&store), ConnectionHub::new());
        let broadcaster = StatusBroadcaster::new(Arc::clone(&store), registry.clone());
        let locker = Locker::new(Arc::clone(&store), LockPolicy::from_config(&config));
        let arbiter = Arc::new(ControlArbiter::new(
            Arc::clone(&store),
            locker,
            broadcaster.clone(),
            &config,
        ));
        let relay = MessageRelay::new(Arc::clone(&arbiter), registry.clone());
        let watcher = ExpirationWatcher::new(Arc::clone(&store));
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&store),
            Arc::clone(&arbiter),
            registry.clone(),
            &config,
        ));
        Arc::new(Self {
            config,
            store,
            registry,
            broadcaster,
            arbiter,
            relay,
            directory,
            verifier,
            watcher,
            monitor,
        })
    }

    /// Wire the lease expiry handler, subscribe to expirations and start the
    /// heartbeat sweeps.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, StoreError> {
        let handler = LeaseExpiryHandler::new(
            Arc::clone(&self.store),
            self.broadcaster.clone(),
            Arc::clone(&self.directory),
            self.config.expiry_dedup_window,
        );
        self.watcher
            .register_handler(LeaseExpiryHandler::PREFIX, Arc::new(handler))
            .await;
        self.watcher.initialize().await?;
        Ok(self.monitor.spawn())
    }

    pub async fn shutdown(&self) {
        self.watcher.close().await;
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &ConnectionHub {
        self.registry.hub()
    }

    pub fn arbiter(&self) -> &Arc<ControlArbiter> {
        &self.arbiter
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    pub fn watcher(&self) -> &ExpirationWatcher {
        &self.watcher
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn verifier(&self) -> &dyn CredentialVerifier {
        self.verifier.as_ref()
    }

    fn reply(&self, peer: &Peer, event: &str, data: Value) {
        if !self.hub().send(&peer.connection_id, Outbound::event(event, data)) {
            debug!(connection_id = %peer.connection_id, event, "reply not delivered");
        }
    }

    /// Record an authenticated operator connection.
    pub async fn open_operator(
        &self,
        peer: &Peer,
        display_name: Option<String>,
    ) -> Result<(), StoreError> {
        if let PeerRole::Operator { user_id } = &peer.role {
            self.registry
                .on_connect(&peer.connection_id, SessionKind::Operator, user_id, display_name)
                .await?;
            info!(connection_id = %peer.connection_id, user_id = %user_id, "operator connected");
        }
        Ok(())
    }

    pub async fn handle_event(&self, peer: &mut Peer, event: ClientEvent) {
        let name = event.name();
        match (&peer.role, event.claimed_user()) {
            (PeerRole::Operator { user_id }, Some(claimed)) if claimed != user_id => {
                warn!(
                    connection_id = %peer.connection_id,
                    user_id = %user_id,
                    claimed,
                    event = name,
                    "event claims another identity, dropping"
                );
                return;
            }
            _ => {}
        }

        match (event, peer.role.clone()) {
            (ClientEvent::Register(register), PeerRole::Agent { .. }) => {
                self.register_agent(peer, register).await;
            }
            (ClientEvent::RequestControl(req), PeerRole::Operator { .. }) => {
                if let Err(err) = self.registry.observe(&peer.connection_id, &req.crane_id).await {
                    warn!(crane_id = %req.crane_id, error = %err, "could not record observed crane");
                }
                let result = self.arbiter.request_control(&req.crane_id, &req.user_id).await;
                if let Err(err) = &result {
                    info!(crane_id = %req.crane_id, user_id = %req.user_id, reason = %err, "control request denied");
                }
                self.reply(peer, name, Reply::from(result.is_ok()).to_value());
            }
            (ClientEvent::ReassignControl(req), PeerRole::Operator { .. }) => {
                let result = self
                    .arbiter
                    .reassign_control(&req.crane_id, &req.from_user_id, &req.to_user_id)
                    .await;
                if let Err(err) = &result {
                    info!(crane_id = %req.crane_id, reason = %err, "reassignment denied");
                }
                self.reply(peer, name, Reply::from(result.is_ok()).to_value());
            }
            (ClientEvent::ReleaseControl(req), PeerRole::Operator { .. }) => {
                let result = self.arbiter.release_control(&req.crane_id, &req.user_id).await;
                self.reply(peer, name, Reply::from(result.is_ok()).to_value());
            }
            (ClientEvent::CheckAccess(req), PeerRole::Operator { .. }) => {
                match self.broadcaster.check_access(&req.crane_id, &req.user_id).await {
                    Ok(envelope) => self.reply(peer, name, envelope.to_value()),
                    Err(err) => {
                        warn!(crane_id = %req.crane_id, error = %err, "check access failed");
                        self.reply(peer, name, Reply::Fail.to_value());
                    }
                }
            }
            (ClientEvent::RefreshStatus(req), PeerRole::Operator { .. }) => {
                self.refresh_status(peer, &req.crane_id, &req.user_id).await;
            }
            (ClientEvent::RelayText(payload), _) => {
                self.relay_text(peer, payload).await;
            }
            (ClientEvent::LocationUpdate(update), PeerRole::Operator { .. }) => {
                self.update_location(peer, update).await;
            }
            (ClientEvent::LocationQuery(query), _) => {
                self.query_location(peer, query).await;
            }
            (ClientEvent::Heartbeat, _) => match self.registry.touch(&peer.connection_id).await {
                Ok(alive) => self.reply(
                    peer,
                    name,
                    json!({ "result": Reply::from(alive).as_str(), "at": now_millis() }),
                ),
                Err(err) => warn!(connection_id = %peer.connection_id, error = %err, "heartbeat not recorded"),
            },
            (ClientEvent::Exit(exit), PeerRole::Operator { user_id }) => {
                self.cleanup_operator(&user_id, exit.place_id.as_deref()).await;
                self.hub().send(&peer.connection_id, Outbound::Close);
            }
            (ClientEvent::ForceMapUpdate { request, payload }, PeerRole::Operator { .. }) => {
                let delivered = self
                    .registry
                    .send_to(
                        SessionKind::Agent,
                        &request.crane_id,
                        Outbound::event(events::FORCE_MAP_UPDATE, payload),
                    )
                    .await
                    .unwrap_or_else(|err| {
                        warn!(crane_id = %request.crane_id, error = %err, "agent lookup failed");
                        false
                    });
                self.reply(peer, name, Reply::from(delivered).to_value());
            }
            (_, role) => {
                warn!(connection_id = %peer.connection_id, event = name, ?role, "event not allowed for this peer");
            }
        }
    }

    async fn register_agent(&self, peer: &mut Peer, register: AgentRegister) {
        let status = register.status.as_deref().and_then(AgentStatus::parse);
        let registration = match self.upsert_agent(&register, status).await {
            Ok(registration) => registration,
            Err(err) => {
                warn!(name = %register.name, error = %err, "agent registration failed");
                self.reply(peer, events::REGISTER, Reply::Fail.to_value());
                return;
            }
        };
        let crane_id = registration.algorithm_id.clone();
        if let Err(err) = self
            .registry
            .on_connect(
                &peer.connection_id,
                SessionKind::Agent,
                &crane_id,
                Some(registration.name.clone()),
            )
            .await
        {
            warn!(crane_id = %crane_id, error = %err, "agent session not recorded");
            self.reply(peer, events::REGISTER, Reply::Fail.to_value());
            return;
        }
        peer.role = PeerRole::Agent {
            crane_id: Some(crane_id.clone()),
        };
        info!(crane_id = %crane_id, name = %registration.name, "agent registered");
        self.reply(
            peer,
            events::REGISTER,
            json!({ "result": Reply::Success.as_str(), "algorithmId": crane_id }),
        );
        if let Err(err) = self.broadcaster.broadcast_crane_status(&crane_id).await {
            warn!(crane_id = %crane_id, error = %err, "status broadcast failed");
        }
    }

    async fn upsert_agent(
        &self,
        register: &AgentRegister,
        status: Option<AgentStatus>,
    ) -> Result<AgentRegistration, crate::directory::DirectoryError> {
        match self.directory.find_by_name(&register.name).await? {
            Some(mut existing) => {
                if let Some(map_name) = &register.map_name {
                    existing.map_name = Some(map_name.clone());
                }
                if let Some(status) = status {
                    existing.status = status;
                }
                if register.description.is_some() {
                    existing.description = register.description.clone();
                }
                self.directory.update(existing.clone()).await?;
                Ok(existing)
            }
            None => {
                let created = AgentRegistration {
                    algorithm_id: Uuid::new_v4().to_string(),
                    name: register.name.clone(),
                    map_name: register.map_name.clone(),
                    status: status.unwrap_or(AgentStatus::Idle),
                    place_id: None,
                    description: register.description.clone(),
                };
                self.directory.create(created.clone()).await?;
                Ok(created)
            }
        }
    }

    async fn refresh_status(&self, peer: &Peer, crane_id: &str, user_id: &str) {
        if let Err(err) = self.registry.observe(&peer.connection_id, crane_id).await {
            warn!(crane_id, error = %err, "could not record observed crane");
            return;
        }
        match self.broadcaster.check_access(crane_id, user_id).await {
            Ok(envelope) => {
                let envelope = StatusEnvelope {
                    action: StatusEnvelope::STATUS_ACTION,
                    ..envelope
                };
                self.reply(peer, events::STATUS_NOTIFY, envelope.to_value());
            }
            Err(err) => warn!(crane_id, error = %err, "status refresh failed"),
        }
    }

    async fn relay_text(&self, peer: &Peer, payload: Value) {
        let session = match self.registry.session(&peer.connection_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!(connection_id = %peer.connection_id, "relay from unregistered connection dropped");
                return;
            }
            Err(err) => {
                warn!(connection_id = %peer.connection_id, error = %err, "relay session lookup failed");
                return;
            }
        };
        if let Err(err) = self.relay.relay_text(&session, payload).await {
            warn!(connection_id = %peer.connection_id, error = %err, "text relay failed");
        }
    }

    pub async fn handle_binary(&self, peer: &Peer, payload: &[u8]) {
        let session = match self.registry.session(&peer.connection_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!(connection_id = %peer.connection_id, len = payload.len(), "binary from unregistered connection dropped");
                return;
            }
            Err(err) => {
                warn!(connection_id = %peer.connection_id, error = %err, "relay session lookup failed");
                return;
            }
        };
        if let Err(err) = self.relay.relay_binary(&session, payload).await {
            warn!(connection_id = %peer.connection_id, error = %err, "binary relay failed");
        }
    }

    async fn update_location(&self, peer: &Peer, update: LocationUpdate) {
        let mut merged = Map::new();
        merged.insert("location".into(), update.location);
        if let Some(info) = update.user_info {
            merged.insert("userInfo".into(), info);
        }
        let now = now_millis();
        let entry = PositionEntry {
            location: Value::Object(merged),
            last_heartbeat_at: Some(now),
        };
        if let Err(err) = self
            .store
            .put_position(&update.place_id, &update.user_id, &entry)
            .await
        {
            warn!(place_id = %update.place_id, error = %err, "position not stored");
        }
        if let Err(err) = self.store.touch_session(&peer.connection_id, now).await {
            warn!(connection_id = %peer.connection_id, error = %err, "heartbeat not recorded");
        }
    }

    async fn query_location(&self, peer: &Peer, query: LocationQuery) {
        let entries = match self.store.raw_positions(&query.place_id).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(place_id = %query.place_id, error = %err, "position query failed");
                self.reply(peer, events::LOCATION_QUERY, Reply::Fail.to_value());
                return;
            }
        };
        let mut positions = Map::new();
        for (user_id, raw) in entries {
            match PositionEntry::decode(&raw) {
                Ok(entry) => {
                    positions.insert(
                        user_id,
                        json!({ "location": entry.location, "lastHeartbeatAt": entry.last_heartbeat_at }),
                    );
                }
                Err(err) => debug!(user_id = %user_id, error = %err, "skipping unreadable position"),
            }
        }
        self.reply(
            peer,
            events::LOCATION_QUERY,
            json!({ "placeId": query.place_id, "positions": positions }),
        );
    }

    /// Release the operator's lease and drop its position entry.
    async fn cleanup_operator(&self, user_id: &str, place_id: Option<&str>) {
        match self.arbiter.release_held(user_id).await {
            Ok(Some(crane_id)) => info!(user_id, crane_id = %crane_id, "lease released on exit"),
            Ok(None) => {}
            Err(err) => warn!(user_id, error = %err, "lease release on exit failed"),
        }
        let place = match place_id {
            Some(place) => Some(place.to_string()),
            None => self.directory.place_of_user(user_id).await.unwrap_or_else(|err| {
                warn!(user_id, error = %err, "place lookup failed");
                None
            }),
        };
        if let Some(place) = place {
            if let Err(err) = self.store.remove_position(&place, user_id).await {
                warn!(user_id, place_id = %place, error = %err, "position not removed");
            }
        }
    }

    pub async fn handle_disconnect(&self, peer: &Peer) {
        match &peer.role {
            PeerRole::Operator { user_id } => {
                let current = self
                    .registry
                    .owns_presence(SessionKind::Operator, user_id, &peer.connection_id)
                    .await;
                if let Err(err) = self.registry.on_disconnect(&peer.connection_id).await {
                    warn!(connection_id = %peer.connection_id, error = %err, "session not removed");
                }
                if current {
                    self.cleanup_operator(user_id, None).await;
                } else {
                    debug!(user_id = %user_id, "operator reconnected elsewhere, keeping lease");
                }
                info!(connection_id = %peer.connection_id, user_id = %user_id, "operator disconnected");
            }
            PeerRole::Agent {
                crane_id: Some(crane_id),
            } => {
                let current = self
                    .registry
                    .owns_presence(SessionKind::Agent, crane_id, &peer.connection_id)
                    .await;
                if current {
                    self.broadcaster.notify_agent_offline(crane_id);
                    if let Err(err) = self.directory.update_status(crane_id, AgentStatus::Idle).await {
                        warn!(crane_id = %crane_id, error = %err, "agent status not reset");
                    }
                    if let Err(err) = self.arbiter.revoke_crane(crane_id).await {
                        warn!(crane_id = %crane_id, error = %err, "lease not released for offline agent");
                    }
                }
                if let Err(err) = self.registry.on_disconnect(&peer.connection_id).await {
                    warn!(connection_id = %peer.connection_id, error = %err, "session not removed");
                }
                info!(crane_id = %crane_id, "agent disconnected");
            }
            PeerRole::Agent { crane_id: None } => {
                self.hub().detach(&peer.connection_id);
                debug!(connection_id = %peer.connection_id, "unregistered agent disconnected");
            }
        }
    }
}
