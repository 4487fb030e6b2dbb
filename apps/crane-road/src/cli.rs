use std::net::SocketAddr;

use clap::Parser;

use crate::config::BrokerConfig;

#[derive(Parser, Debug, Default)]
#[command(name = "crane-road")]
#[command(about = "Crane control arbitration and session broker")]
pub struct Cli {
    /// Address for the websocket listener (overrides CRANE_ROAD_ADDR)
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Coordination store URL (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Log filter directive (overrides RUST_LOG)
    #[arg(long)]
    pub log: Option<String>,
}

impl Cli {
    /// Layer command-line flags on top of the environment configuration.
    pub fn apply(self, mut config: BrokerConfig) -> BrokerConfig {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(url) = self.redis_url {
            config.redis_url = Some(url);
        }
        if let Some(filter) = self.log {
            config.log_filter = filter;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flags_override_environment() {
        let cli = Cli::parse_from([
            "crane-road",
            "--bind",
            "127.0.0.1:4000",
            "--redis-url",
            "redis://cache:6379",
        ]);
        let config = cli.apply(BrokerConfig::default());
        assert_eq!(config.bind_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.log_filter, "info,crane_road=debug");
    }
}
