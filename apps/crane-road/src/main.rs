use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use crane_sdk::memory::InMemoryCoordinationStore;
use crane_sdk::store::CoordinationStore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crane_road::auth::{CredentialVerifier, DenyAll, JwtVerifier};
use crane_road::broker::Broker;
use crane_road::cli::Cli;
use crane_road::config::BrokerConfig;
use crane_road::directory::InMemoryDirectory;
use crane_road::redis_store::RedisCoordinationStore;
use crane_road::telemetry;
use crane_road::websocket::{health_check, websocket_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.apply(BrokerConfig::from_env());
    telemetry::init_tracing(&config.log_filter);

    let store: Arc<dyn CoordinationStore> = match config.redis_url.as_deref() {
        Some(url) => {
            info!("using coordination store at {}", url);
            Arc::new(
                RedisCoordinationStore::connect(url)
                    .await
                    .context("connecting to coordination store")?,
            )
        }
        None => {
            warn!("REDIS_URL not set; using a process-local store, leases are not shared");
            let memory = InMemoryCoordinationStore::new();
            memory.spawn_reaper(Duration::from_millis(500));
            memory
        }
    };

    let verifier: Arc<dyn CredentialVerifier> = match config.jwt_secret.as_deref() {
        Some(secret) => Arc::new(JwtVerifier::new(secret)),
        None => {
            warn!("CRANE_JWT_SECRET not set; operator connections will be refused");
            Arc::new(DenyAll)
        }
    };

    let bind_addr = config.bind_addr;
    let broker = Broker::new(config, store, InMemoryDirectory::new(), verifier);
    let _sweeps = broker.start().await.context("starting broker")?;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(Arc::clone(&broker))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!("crane-road listening on {}", bind_addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    broker.shutdown().await;
    result.context("serving")?;
    Ok(())
}
