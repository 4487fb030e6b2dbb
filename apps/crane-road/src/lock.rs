use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crane_sdk::store::{CoordinationStore, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub ttl: Duration,
}

impl LockPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            attempts: config.lock_attempts.max(1),
            backoff: config.lock_backoff,
            ttl: config.lock_ttl,
        }
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
            ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} still held after {attempts} attempts")]
    Unavailable { key: String, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Named short-lived mutual exclusion over the coordination store.
#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn CoordinationStore>,
    policy: LockPolicy,
}

impl Locker {
    pub fn new(store: Arc<dyn CoordinationStore>, policy: LockPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Run `op` while holding `key`. The lock is released afterwards whatever
    /// the outcome, including when it was never acquired.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let token = Uuid::new_v4().to_string();
        let acquired = self.acquire(key, &token).await;
        let outcome = match acquired {
            Ok(()) => op().await,
            Err(err) => Err(E::from(err)),
        };
        self.release(key, &token).await;
        outcome
    }

    async fn acquire(&self, key: &str, token: &str) -> Result<(), LockError> {
        for attempt in 1..=self.policy.attempts {
            match self.store.try_lock(key, token, self.policy.ttl).await {
                Ok(true) => {
                    debug!(key, attempt, "lock acquired");
                    return Ok(());
                }
                Ok(false) => debug!(key, attempt, "lock busy"),
                Err(err) => warn!(key, attempt, error = %err, "lock attempt failed"),
            }
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }
        Err(LockError::Unavailable {
            key: key.to_string(),
            attempts: self.policy.attempts,
        })
    }

    async fn release(&self, key: &str, token: &str) {
        match self.store.unlock(key, token).await {
            Ok(true) => debug!(key, "lock released"),
            Ok(false) => {}
            Err(err) => warn!(key, error = %err, "lock release failed; ttl will reclaim it"),
        }
    }
}
