use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// What happens when an operator who already holds one crane asks for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePolicy {
    /// The request fails while the operator holds a different crane.
    RejectWhileHolding,
    /// The previous crane is released in the same batch that grants the new one.
    HandOver,
}

impl LeasePolicy {
    fn from_env() -> Self {
        match env::var("CRANE_LEASE_POLICY")
            .unwrap_or_else(|_| "reject".into())
            .as_str()
        {
            "handover" | "hand-over" => LeasePolicy::HandOver,
            _ => LeasePolicy::RejectWhileHolding,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub redis_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub lease_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_attempts: u32,
    pub lock_backoff: Duration,
    pub sweep_interval: Duration,
    pub session_timeout: Duration,
    pub position_timeout: Duration,
    pub expiry_dedup_window: Duration,
    pub lease_policy: LeasePolicy,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let bind_addr = env::var("CRANE_ROAD_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind_addr);
        let log_filter = env::var("RUST_LOG").unwrap_or(defaults.log_filter);
        Self {
            bind_addr,
            log_filter,
            redis_url: env::var("REDIS_URL").ok(),
            jwt_secret: env::var("CRANE_JWT_SECRET").ok(),
            lease_ttl: Duration::from_secs(env_u64("CRANE_LEASE_TTL_SECS", 3_600)),
            lock_ttl: Duration::from_millis(env_u64("CRANE_LOCK_TTL_MS", 5_000)),
            lock_attempts: env_u64("CRANE_LOCK_ATTEMPTS", 3).max(1) as u32,
            lock_backoff: Duration::from_millis(env_u64("CRANE_LOCK_BACKOFF_MS", 200)),
            sweep_interval: Duration::from_secs(env_u64("CRANE_SWEEP_INTERVAL_SECS", 30).max(1)),
            session_timeout: Duration::from_secs(env_u64("CRANE_SESSION_TIMEOUT_SECS", 10)),
            position_timeout: Duration::from_secs(env_u64("CRANE_POSITION_TIMEOUT_SECS", 20)),
            expiry_dedup_window: Duration::from_millis(env_u64("CRANE_EXPIRY_DEDUP_MS", 5_000)),
            lease_policy: LeasePolicy::from_env(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 30002)),
            log_filter: "info,crane_road=debug".to_string(),
            redis_url: None,
            jwt_secret: None,
            lease_ttl: Duration::from_secs(3_600),
            lock_ttl: Duration::from_secs(5),
            lock_attempts: 3,
            lock_backoff: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(30),
            session_timeout: Duration::from_secs(10),
            position_timeout: Duration::from_secs(20),
            expiry_dedup_window: Duration::from_secs(5),
            lease_policy: LeasePolicy::RejectWhileHolding,
        }
    }
}
