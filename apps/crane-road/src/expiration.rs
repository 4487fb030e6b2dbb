//! Dispatches key-expiration events from the coordination store to handlers
//! registered by key prefix.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crane_sdk::store::{keys, CoordinationStore, StoreError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::directory::{AgentDirectory, AgentStatus};
use crate::status::StatusBroadcaster;

#[async_trait]
pub trait ExpirationHandler: Send + Sync {
    /// `suffix` is the expired key with the registered prefix removed.
    async fn on_expired(&self, key: &str, suffix: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct Route {
    prefix: String,
    handler: Arc<dyn ExpirationHandler>,
}

pub struct ExpirationWatcher {
    store: Arc<dyn CoordinationStore>,
    routes: Arc<RwLock<Vec<Route>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationWatcher {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            routes: Arc::new(RwLock::new(Vec::new())),
            task: Mutex::new(None),
        }
    }

    pub async fn register_handler(&self, prefix: &str, handler: Arc<dyn ExpirationHandler>) {
        self.routes.write().await.push(Route {
            prefix: prefix.to_string(),
            handler,
        });
        debug!(prefix, "expiration handler registered");
    }

    /// Subscribe to expiry events. Calling it again while running only warns.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("expiration watcher already initialized");
            return Ok(());
        }
        let mut subscription = self.store.subscribe_expirations().await?;
        let routes = Arc::clone(&self.routes);
        *task = Some(tokio::spawn(async move {
            while let Some(key) = subscription.recv().await {
                dispatch(&routes, &key).await;
            }
            warn!("expiration event stream ended");
        }));
        info!("expiration watcher listening");
        Ok(())
    }

    /// Deliver one expired key as if it came from the store.
    pub async fn dispatch(&self, key: &str) -> usize {
        dispatch(&self.routes, key).await
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop listening. Dropping the subscription releases its connection.
    pub async fn close(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
            info!("expiration watcher closed");
        }
    }
}

/// Run every handler whose prefix matches, each in its own task so a panic
/// stays contained. Returns how many handlers completed cleanly.
async fn dispatch(routes: &RwLock<Vec<Route>>, key: &str) -> usize {
    let matching: Vec<Route> = routes
        .read()
        .await
        .iter()
        .filter(|r| key.starts_with(&r.prefix))
        .cloned()
        .collect();
    if matching.is_empty() {
        return 0;
    }
    let mut completed = 0;
    for route in matching {
        let suffix = key[route.prefix.len()..].to_string();
        let owned_key = key.to_string();
        let handler = Arc::clone(&route.handler);
        let outcome =
            tokio::spawn(async move { handler.on_expired(&owned_key, &suffix).await }).await;
        match outcome {
            Ok(Ok(())) => completed += 1,
            Ok(Err(err)) => warn!(key, prefix = %route.prefix, error = %err, "expiration handler failed"),
            Err(err) => error!(key, prefix = %route.prefix, error = %err, "expiration handler panicked"),
        }
    }
    completed
}

/// Reacts to a lapsed control lease: tells everyone the crane is free and
/// puts its agent back to idle, once per expiry.
pub struct LeaseExpiryHandler {
    store: Arc<dyn CoordinationStore>,
    broadcaster: StatusBroadcaster,
    directory: Arc<dyn AgentDirectory>,
    dedup_window: Duration,
}

impl LeaseExpiryHandler {
    pub const PREFIX: &'static str = keys::LEASE_PREFIX;

    pub fn new(
        store: Arc<dyn CoordinationStore>,
        broadcaster: StatusBroadcaster,
        directory: Arc<dyn AgentDirectory>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            store,
            broadcaster,
            directory,
            dedup_window,
        }
    }
}

#[async_trait]
impl ExpirationHandler for LeaseExpiryHandler {
    async fn on_expired(&self, key: &str, crane_id: &str) -> anyhow::Result<()> {
        if crane_id.is_empty() {
            anyhow::bail!("expired lease key {key} has no crane id");
        }
        if !self.store.claim_expiry(crane_id, self.dedup_window).await? {
            debug!(crane_id, "duplicate lease expiry ignored");
            return Ok(());
        }
        info!(crane_id, "control lease expired");
        self.broadcaster.notify_control_expired(crane_id);
        self.directory
            .update_status(crane_id, AgentStatus::Idle)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crane_sdk::memory::InMemoryCoordinationStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        seen: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ExpirationHandler for Recorder {
        async fn on_expired(&self, key: &str, suffix: &str) -> anyhow::Result<()> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((key.to_string(), suffix.to_string()));
            }
            Ok(())
        }
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl ExpirationHandler for Failing {
        async fn on_expired(&self, _key: &str, _suffix: &str) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("handler exploded")
        }
    }

    #[tokio::test]
    async fn routes_by_prefix_with_suffix() {
        let watcher = ExpirationWatcher::new(InMemoryCoordinationStore::new());
        let recorder = Arc::new(Recorder::default());
        watcher.register_handler("lease:crane:", recorder.clone()).await;

        assert_eq!(watcher.dispatch("lease:crane:c7").await, 1);
        assert_eq!(watcher.dispatch("session:x").await, 0);
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("lease:crane:c7".to_string(), "c7".to_string())]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let watcher = ExpirationWatcher::new(InMemoryCoordinationStore::new());
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let recorder = Arc::new(Recorder::default());
        watcher.register_handler("lease:", failing.clone()).await;
        watcher.register_handler("lease:crane:", recorder.clone()).await;

        assert_eq!(watcher.dispatch("lease:crane:c1").await, 1);
        assert_eq!(failing.0.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn initialize_twice_is_a_noop_and_close_stops() {
        let store = InMemoryCoordinationStore::new();
        let watcher = ExpirationWatcher::new(store.clone());
        let recorder = Arc::new(Recorder::default());
        watcher.register_handler("lease:crane:", recorder.clone()).await;
        watcher.initialize().await.unwrap();
        watcher.initialize().await.unwrap();
        assert!(watcher.is_running().await);

        store.publish_expired("lease:crane:c2").await;
        for _ in 0..50 {
            if !recorder.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);

        watcher.close().await;
        assert!(!watcher.is_running().await);
    }
}
