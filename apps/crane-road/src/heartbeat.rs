use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crane_sdk::now_millis;
use crane_sdk::store::{CoordinationStore, PositionEntry, SessionKind, StoreError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::lease::ControlArbiter;
use crate::registry::{ConnectionRegistry, Outbound};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSweep {
    pub scanned: usize,
    pub evicted: usize,
    pub released: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionSweep {
    pub buckets: usize,
    pub evicted: usize,
}

/// Periodic failure detector. Two sweeps, each skipped while its previous
/// run is still going.
pub struct HeartbeatMonitor {
    store: Arc<dyn CoordinationStore>,
    arbiter: Arc<ControlArbiter>,
    registry: ConnectionRegistry,
    interval: Duration,
    session_timeout: Duration,
    position_timeout: Duration,
    sessions_running: AtomicBool,
    positions_running: AtomicBool,
}

/// Clears a running flag when the sweep ends, including by unwinding.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn enter(flag: &AtomicBool) -> Option<RunningGuard<'_>> {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .ok()
        .map(|_| RunningGuard(flag))
}

fn older_than(at: i64, now: i64, timeout: Duration) -> bool {
    now.saturating_sub(at) > timeout.as_millis() as i64
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        arbiter: Arc<ControlArbiter>,
        registry: ConnectionRegistry,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            store,
            arbiter,
            registry,
            interval: config.sweep_interval,
            session_timeout: config.session_timeout,
            position_timeout: config.position_timeout,
            sessions_running: AtomicBool::new(false),
            positions_running: AtomicBool::new(false),
        }
    }

    /// Start both sweep loops. Each tick runs in its own task so a slow
    /// sweep makes the next tick skip rather than queue.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sessions = {
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let monitor = Arc::clone(&monitor);
                    tokio::spawn(async move {
                        monitor.sweep_sessions().await;
                    });
                }
            })
        };
        let positions = {
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let monitor = Arc::clone(&monitor);
                    tokio::spawn(async move {
                        monitor.sweep_positions().await;
                    });
                }
            })
        };
        info!(interval_secs = self.interval.as_secs(), "heartbeat monitor started");
        vec![sessions, positions]
    }

    /// Evict operator sessions whose last heartbeat is too old and release
    /// their leases, unless the operator has since reconnected. `None` when a previous sweep is still running.
    pub async fn sweep_sessions(&self) -> Option<SessionSweep> {
        let Some(_guard) = enter(&self.sessions_running) else {
            debug!("session sweep still running, skipping tick");
            return None;
        };
        match self.sweep_sessions_inner().await {
            Ok(report) => {
                if report.evicted > 0 {
                    info!(
                        scanned = report.scanned,
                        evicted = report.evicted,
                        released = report.released,
                        "session sweep evicted stale sessions"
                    );
                }
                Some(report)
            }
            Err(err) => {
                warn!(error = %err, "session sweep aborted");
                Some(SessionSweep::default())
            }
        }
    }

    async fn sweep_sessions_inner(&self) -> Result<SessionSweep, StoreError> {
        let ids = self.store.session_ids().await?;
        let now = now_millis();
        let mut report = SessionSweep {
            scanned: ids.len(),
            ..SessionSweep::default()
        };
        for connection_id in ids {
            let session = match self.store.session(&connection_id).await {
                Ok(Some(session)) => session,
                Ok(None) => {
                    // Index entry without a record.
                    self.store.remove_session(&connection_id).await?;
                    continue;
                }
                Err(StoreError::Malformed { key, reason }) => {
                    warn!(%key, %reason, "evicting malformed session");
                    self.evict(&connection_id).await;
                    report.evicted += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if session.kind != SessionKind::Operator
                || !older_than(session.last_heartbeat_at, now, self.session_timeout)
            {
                continue;
            }
            info!(
                connection_id = %session.connection_id,
                user_id = %session.entity_id,
                "session heartbeat timed out"
            );
            let current = self
                .registry
                .owns_presence(SessionKind::Operator, &session.entity_id, &connection_id)
                .await;
            self.evict(&connection_id).await;
            report.evicted += 1;
            if !current {
                debug!(user_id = %session.entity_id, "operator reconnected elsewhere, keeping lease");
                continue;
            }
            match self.arbiter.release_held(&session.entity_id).await {
                Ok(Some(crane_id)) => {
                    debug!(user_id = %session.entity_id, crane_id = %crane_id, "released stale lease");
                    report.released += 1;
                }
                Ok(None) => {}
                Err(err) => warn!(user_id = %session.entity_id, error = %err, "stale lease release failed"),
            }
        }
        Ok(report)
    }

    async fn evict(&self, connection_id: &str) {
        self.registry.hub().send(connection_id, Outbound::Close);
        if let Err(err) = self.registry.on_disconnect(connection_id).await {
            warn!(connection_id, error = %err, "failed to remove stale session");
        }
    }

    /// Drop position entries that are stale, lack a heartbeat or do not parse.
    pub async fn sweep_positions(&self) -> Option<PositionSweep> {
        let Some(_guard) = enter(&self.positions_running) else {
            debug!("position sweep still running, skipping tick");
            return None;
        };
        let buckets = match self.store.position_buckets().await {
            Ok(buckets) => buckets,
            Err(err) => {
                warn!(error = %err, "position sweep aborted");
                return Some(PositionSweep::default());
            }
        };
        let now = now_millis();
        let mut report = PositionSweep {
            buckets: buckets.len(),
            evicted: 0,
        };
        for place_id in buckets {
            let entries = match self.store.raw_positions(&place_id).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(place_id = %place_id, error = %err, "skipping position bucket");
                    continue;
                }
            };
            let stale: Vec<String> = entries
                .into_iter()
                .filter(|(_, raw)| match PositionEntry::decode(raw) {
                    Ok(entry) => entry
                        .last_heartbeat_at
                        .map_or(true, |at| older_than(at, now, self.position_timeout)),
                    Err(_) => true,
                })
                .map(|(user_id, _)| user_id)
                .collect();
            if stale.is_empty() {
                continue;
            }
            match self.store.evict_positions(&place_id, &stale).await {
                Ok(()) => {
                    debug!(place_id = %place_id, evicted = stale.len(), "stale positions evicted");
                    report.evicted += stale.len();
                }
                Err(err) => warn!(place_id = %place_id, error = %err, "position eviction failed"),
            }
        }
        Some(report)
    }
}
