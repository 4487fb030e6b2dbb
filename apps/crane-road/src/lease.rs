//! Control lease arbitration.
//!
//! Every lease mutation on a crane runs under `lock:lease:<craneId>` and ends
//! in one atomic store batch, so the forward (`crane -> holder`) and reverse
//! (`holder -> crane`) entries never disagree.

use std::sync::Arc;
use std::time::Duration;

use crane_sdk::store::{keys, CoordinationStore, LeaseMutation, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, LeasePolicy};
use crate::lock::{LockError, Locker};
use crate::status::StatusBroadcaster;

/// Lock operation name shared by request, reassign and release so that all
/// of them are totally ordered per crane.
const LEASE_LOCK: &str = "lease";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("crane {crane_id} is held by {holder_id}")]
    AlreadyHeld { crane_id: String, holder_id: String },
    #[error("{user_id} does not hold crane {crane_id}")]
    NotHolder { crane_id: String, user_id: String },
    #[error("{user_id} already holds crane {crane_id}")]
    HoldsOther { user_id: String, crane_id: String },
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LockError> for ControlError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Unavailable { key, .. } => ControlError::LockUnavailable(key),
            LockError::Store(err) => ControlError::Store(err),
        }
    }
}

/// A forward entry whose holder does not point back at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMismatch {
    pub crane_id: String,
    pub holder_id: String,
    pub reverse: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub leases: usize,
    pub mismatches: Vec<IndexMismatch>,
}

impl IndexReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct ControlArbiter {
    store: Arc<dyn CoordinationStore>,
    locker: Locker,
    broadcaster: StatusBroadcaster,
    lease_ttl: Duration,
    policy: LeasePolicy,
}

impl ControlArbiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        locker: Locker,
        broadcaster: StatusBroadcaster,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            store,
            locker,
            broadcaster,
            lease_ttl: config.lease_ttl,
            policy: config.lease_policy,
        }
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    fn grant(&self, crane_id: &str, holder_id: &str) -> LeaseMutation {
        LeaseMutation::Grant {
            crane_id: crane_id.to_string(),
            holder_id: holder_id.to_string(),
            ttl: self.lease_ttl,
        }
    }

    /// The crane `user_id` really holds: the reverse entry, confirmed by the
    /// forward entry it points at.
    async fn held_crane(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let Some(crane_id) = self.store.leased_crane(user_id).await? else {
            return Ok(None);
        };
        let confirmed = self
            .store
            .lease(&crane_id)
            .await?
            .is_some_and(|l| l.holder_id == user_id);
        if !confirmed {
            debug!(user_id, crane_id = %crane_id, "ignoring stale reverse entry");
        }
        Ok(confirmed.then_some(crane_id))
    }

    /// Grant `crane_id` to `user_id`. Re-requesting a crane already held
    /// refreshes its TTL.
    pub async fn request_control(&self, crane_id: &str, user_id: &str) -> Result<(), ControlError> {
        let key = keys::lock(LEASE_LOCK, crane_id);
        let handed_over = self
            .locker
            .with_lock::<_, ControlError, _, _>(&key, || async {
                if let Some(lease) = self.store.lease(crane_id).await? {
                    if lease.holder_id != user_id {
                        return Err(ControlError::AlreadyHeld {
                            crane_id: crane_id.to_string(),
                            holder_id: lease.holder_id,
                        });
                    }
                }
                match self.held_crane(user_id).await? {
                    Some(previous) if previous != crane_id => match self.policy {
                        LeasePolicy::RejectWhileHolding => Err(ControlError::HoldsOther {
                            user_id: user_id.to_string(),
                            crane_id: previous,
                        }),
                        LeasePolicy::HandOver => {
                            self.hand_over(&previous, crane_id, user_id).await?;
                            Ok(Some(previous))
                        }
                    },
                    _ => {
                        self.store
                            .apply_lease_batch(&[self.grant(crane_id, user_id)])
                            .await?;
                        Ok(None)
                    }
                }
            })
            .await?;

        info!(crane_id, user_id, "control granted");
        if let Some(previous) = handed_over {
            self.broadcast(&previous).await;
        }
        self.broadcast(crane_id).await;
        Ok(())
    }

    /// Move `user_id` from `previous` to `crane_id` in one batch, holding the
    /// lock of the crane being given up as well.
    async fn hand_over(
        &self,
        previous: &str,
        crane_id: &str,
        user_id: &str,
    ) -> Result<(), ControlError> {
        let key = keys::lock(LEASE_LOCK, previous);
        self.locker
            .with_lock::<_, ControlError, _, _>(&key, || async {
                let mut batch = Vec::with_capacity(2);
                if self
                    .store
                    .lease(previous)
                    .await?
                    .is_some_and(|l| l.holder_id == user_id)
                {
                    batch.push(LeaseMutation::Revoke {
                        crane_id: previous.to_string(),
                    });
                }
                batch.push(self.grant(crane_id, user_id));
                self.store.apply_lease_batch(&batch).await?;
                debug!(user_id, from = previous, to = crane_id, "lease handed over");
                Ok(())
            })
            .await
    }

    /// Transfer `crane_id` from its current holder `from_user` to `to_user`.
    pub async fn reassign_control(
        &self,
        crane_id: &str,
        from_user: &str,
        to_user: &str,
    ) -> Result<(), ControlError> {
        let key = keys::lock(LEASE_LOCK, crane_id);
        self.locker
            .with_lock::<_, ControlError, _, _>(&key, || async {
                let holder = self.store.lease(crane_id).await?.map(|l| l.holder_id);
                if holder.as_deref() != Some(from_user) {
                    return Err(ControlError::NotHolder {
                        crane_id: crane_id.to_string(),
                        user_id: from_user.to_string(),
                    });
                }
                if let Some(other) = self.held_crane(to_user).await? {
                    if other != crane_id {
                        return Err(ControlError::HoldsOther {
                            user_id: to_user.to_string(),
                            crane_id: other,
                        });
                    }
                }
                let mut batch = Vec::with_capacity(2);
                if from_user != to_user {
                    batch.push(LeaseMutation::ClearHolder {
                        holder_id: from_user.to_string(),
                    });
                }
                batch.push(self.grant(crane_id, to_user));
                self.store.apply_lease_batch(&batch).await?;
                Ok(())
            })
            .await?;

        info!(crane_id, from_user, to_user, "control reassigned");
        self.broadcast(crane_id).await;
        Ok(())
    }

    /// Give up `crane_id`. Only deletes anything when `user_id`'s reverse
    /// entry points at the crane, and always recomputes the crane's status.
    /// Returns whether the forward entry was removed.
    pub async fn release_control(&self, crane_id: &str, user_id: &str) -> Result<bool, ControlError> {
        let key = keys::lock(LEASE_LOCK, crane_id);
        let result = self
            .locker
            .with_lock::<_, ControlError, _, _>(&key, || async {
                if self.store.leased_crane(user_id).await?.as_deref() != Some(crane_id) {
                    return Ok(false);
                }
                let owns_forward = self
                    .store
                    .lease(crane_id)
                    .await?
                    .is_some_and(|l| l.holder_id == user_id);
                let mut batch = vec![LeaseMutation::ClearHolder {
                    holder_id: user_id.to_string(),
                }];
                if owns_forward {
                    batch.push(LeaseMutation::Revoke {
                        crane_id: crane_id.to_string(),
                    });
                }
                self.store.apply_lease_batch(&batch).await?;
                Ok(owns_forward)
            })
            .await;

        match &result {
            Ok(true) => info!(crane_id, user_id, "control released"),
            Ok(false) => debug!(crane_id, user_id, "release with nothing to delete"),
            Err(err) => warn!(crane_id, user_id, error = %err, "release failed"),
        }
        self.broadcast(crane_id).await;
        result
    }

    /// Release whatever crane `user_id` holds. Returns that crane.
    pub async fn release_held(&self, user_id: &str) -> Result<Option<String>, ControlError> {
        let Some(crane_id) = self.store.leased_crane(user_id).await? else {
            return Ok(None);
        };
        self.release_control(&crane_id, user_id).await?;
        Ok(Some(crane_id))
    }

    /// Drop the lease on `crane_id` whoever holds it. Used when the crane's
    /// agent goes away. Returns the former holder.
    pub async fn revoke_crane(&self, crane_id: &str) -> Result<Option<String>, ControlError> {
        let key = keys::lock(LEASE_LOCK, crane_id);
        let holder = self
            .locker
            .with_lock::<_, ControlError, _, _>(&key, || async {
                let Some(lease) = self.store.lease(crane_id).await? else {
                    return Ok(None);
                };
                let mut batch = vec![LeaseMutation::Revoke {
                    crane_id: crane_id.to_string(),
                }];
                if self.store.leased_crane(&lease.holder_id).await?.as_deref() == Some(crane_id) {
                    batch.push(LeaseMutation::ClearHolder {
                        holder_id: lease.holder_id.clone(),
                    });
                }
                self.store.apply_lease_batch(&batch).await?;
                Ok(Some(lease.holder_id))
            })
            .await?;
        if let Some(holder) = &holder {
            info!(crane_id, holder = %holder, "lease revoked");
            self.broadcast(crane_id).await;
        }
        Ok(holder)
    }

    pub async fn find_crane_by_user(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        self.store.leased_crane(user_id).await
    }

    pub async fn find_user_by_crane(&self, crane_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.store.lease(crane_id).await?.map(|l| l.holder_id))
    }

    /// Full scan of forward entries checking each against the reverse index.
    /// Diagnostics only; nothing on the request path calls this.
    pub async fn diagnose_index(&self) -> Result<IndexReport, StoreError> {
        let leases = self.store.scan_leases().await?;
        let mut report = IndexReport {
            leases: leases.len(),
            mismatches: Vec::new(),
        };
        for lease in leases {
            let reverse = self.store.leased_crane(&lease.holder_id).await?;
            if reverse.as_deref() != Some(lease.crane_id.as_str()) {
                report.mismatches.push(IndexMismatch {
                    crane_id: lease.crane_id,
                    holder_id: lease.holder_id,
                    reverse,
                });
            }
        }
        if !report.is_consistent() {
            warn!(mismatches = report.mismatches.len(), "lease index disagreement");
        }
        Ok(report)
    }

    async fn broadcast(&self, crane_id: &str) {
        if let Err(err) = self.broadcaster.broadcast_crane_status(crane_id).await {
            warn!(crane_id, error = %err, "status broadcast failed");
        }
    }
}
