use std::sync::Arc;

use crane_sdk::now_millis;
use crane_sdk::protocol::{
    agent_offline_notice, control_expired_notice, events, CraneStatus, StatusEnvelope,
};
use crane_sdk::store::{CoordinationStore, SessionKind, StoreError};
use tracing::debug;

use crate::registry::{ConnectionRegistry, Outbound};

/// Pushes free/using/occupied views of a crane to the operators watching it.
#[derive(Clone)]
pub struct StatusBroadcaster {
    store: Arc<dyn CoordinationStore>,
    registry: ConnectionRegistry,
}

impl StatusBroadcaster {
    pub fn new(store: Arc<dyn CoordinationStore>, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    async fn holder(&self, crane_id: &str) -> Result<(Option<String>, Option<String>), StoreError> {
        let holder = self.store.lease(crane_id).await?.map(|l| l.holder_id);
        let user_name = match &holder {
            Some(holder_id) => {
                self.registry
                    .display_name(SessionKind::Operator, holder_id)
                    .await?
            }
            None => None,
        };
        Ok((holder, user_name))
    }

    /// One status push per operator session observing `crane_id`.
    pub async fn broadcast_crane_status(&self, crane_id: &str) -> Result<usize, StoreError> {
        let (holder, user_name) = self.holder(crane_id).await?;
        let observers = self.store.observers(crane_id).await?;
        let mut delivered = 0;
        for observer in observers
            .iter()
            .filter(|o| o.kind == SessionKind::Operator)
        {
            let envelope = StatusEnvelope {
                action: StatusEnvelope::STATUS_ACTION,
                crane_id: crane_id.to_string(),
                status: CraneStatus::for_viewer(holder.as_deref(), &observer.entity_id),
                current_occupied_id: holder.clone(),
                user_name: user_name.clone(),
            };
            let message = Outbound::event(events::STATUS_NOTIFY, envelope.to_value());
            if self.registry.hub().send(&observer.connection_id, message) {
                delivered += 1;
            }
        }
        debug!(
            crane_id,
            holder = holder.as_deref().unwrap_or("-"),
            observers = observers.len(),
            delivered,
            "crane status broadcast"
        );
        Ok(delivered)
    }

    /// The status `user_id` would see for `crane_id` right now.
    pub async fn check_access(
        &self,
        crane_id: &str,
        user_id: &str,
    ) -> Result<StatusEnvelope, StoreError> {
        let (holder, user_name) = self.holder(crane_id).await?;
        Ok(StatusEnvelope {
            action: StatusEnvelope::CHECK_ACTION,
            crane_id: crane_id.to_string(),
            status: CraneStatus::for_viewer(holder.as_deref(), user_id),
            current_occupied_id: holder,
            user_name,
        })
    }

    pub fn notify_control_expired(&self, crane_id: &str) -> usize {
        let notice = control_expired_notice(crane_id, now_millis());
        let reached = self.registry.hub().broadcast(events::STATUS_NOTIFY, &notice);
        debug!(crane_id, reached, "control expiry broadcast");
        reached
    }

    pub fn notify_agent_offline(&self, crane_id: &str) -> usize {
        let notice = agent_offline_notice(crane_id);
        self.registry.hub().broadcast(events::STATUS_NOTIFY, &notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crane_sdk::memory::InMemoryCoordinationStore;
    use crane_sdk::store::{LeaseMutation, LeaseStore};
    use std::time::Duration;

    use crate::registry::ConnectionHub;

    async fn observer(registry: &ConnectionRegistry, conn: &str, user: &str, crane: &str) {
        registry
            .on_connect(conn, SessionKind::Operator, user, Some(format!("name-{user}")))
            .await
            .unwrap();
        registry.observe(conn, crane).await.unwrap();
    }

    fn status_of(message: Option<Outbound>, crane: &str) -> String {
        match message {
            Some(Outbound::Event { data, .. }) => data[crane].as_str().unwrap().to_string(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn holder_sees_using_and_others_occupied() {
        let store = InMemoryCoordinationStore::new();
        let registry = ConnectionRegistry::new(store.clone(), ConnectionHub::new());
        let broadcaster = StatusBroadcaster::new(store.clone(), registry.clone());
        let mut a = registry.hub().attach("ca");
        let mut b = registry.hub().attach("cb");
        observer(&registry, "ca", "ua", "crane-1").await;
        observer(&registry, "cb", "ub", "crane-1").await;

        assert_eq!(broadcaster.broadcast_crane_status("crane-1").await.unwrap(), 2);
        assert_eq!(status_of(a.recv().await, "crane-1"), "free");
        assert_eq!(status_of(b.recv().await, "crane-1"), "free");

        store
            .apply_lease_batch(&[LeaseMutation::Grant {
                crane_id: "crane-1".into(),
                holder_id: "ua".into(),
                ttl: Duration::from_secs(60),
            }])
            .await
            .unwrap();
        broadcaster.broadcast_crane_status("crane-1").await.unwrap();
        assert_eq!(status_of(a.recv().await, "crane-1"), "using");
        assert_eq!(status_of(b.recv().await, "crane-1"), "occupied");

        let envelope = broadcaster.check_access("crane-1", "ub").await.unwrap();
        assert_eq!(envelope.status, CraneStatus::Occupied);
        assert_eq!(envelope.current_occupied_id.as_deref(), Some("ua"));
        assert_eq!(envelope.user_name.as_deref(), Some("name-ua"));
    }

    #[tokio::test]
    async fn expiry_notice_reaches_every_socket() {
        let store = InMemoryCoordinationStore::new();
        let registry = ConnectionRegistry::new(store.clone(), ConnectionHub::new());
        let broadcaster = StatusBroadcaster::new(store, registry.clone());
        let mut a = registry.hub().attach("ca");
        assert_eq!(broadcaster.notify_control_expired("crane-3"), 1);
        assert_eq!(status_of(a.recv().await, "crane-3"), "free");
        assert_eq!(broadcaster.notify_agent_offline("crane-3"), 1);
        assert_eq!(status_of(a.recv().await, "crane-3"), "disconnected");
    }
}
