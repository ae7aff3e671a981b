//! # w3b2-gateway
//!
//! HTTP and WebSocket front of the W3B2 bridge.
//!
//! This binary provides:
//! - **Mirror queries** for admin and user profiles, funding requests and stats
//! - **Command dispatch** with confirmation tracking and cancellation
//! - **Session handshakes** and encrypt/decrypt under a session key
//! - **WebSocket subscriptions** for chain events, notices and sync status
//! - **Connector endpoints** where an external indexer pushes raw events and
//!   a relayer drains signed submissions
//! - **ChainCard management**, one sealed card per user-service relationship

mod api;
mod config;
mod error;
mod wire;
mod ws;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use w3b2_engine::{Bridge, ChannelConnector, MasterKey};
use w3b2_store::Database;

use crate::api::AppState;
use crate::config::GatewayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,w3b2_engine=debug,w3b2_gateway=debug")),
        )
        .init();

    info!("Starting W3B2 bridge gateway v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = GatewayConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        database = %config.database_path.display(),
        operator_api = config.admin_token.is_some(),
        engine = ?config.engine,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;

    let master_key = config.keystore_key.clone().unwrap_or_else(|| {
        warn!("KEYSTORE_PASSPHRASE not set, cards issued this run will not open after restart");
        MasterKey::ephemeral()
    });

    let connector = ChannelConnector::new();
    let bridge = Bridge::new(
        db,
        Arc::new(connector.clone()),
        master_key,
        config.engine.clone(),
    )?;
    info!(cards = bridge.keystore().list(None)?.len(), "Keystore opened");
    let driver = bridge.start()?;

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Idle sessions and overdue confirmations
    let sweeper = bridge.clone();
    let every = config.sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match sweeper.sweep(chrono::Utc::now()).await {
                Ok((0, 0)) => {}
                Ok((sessions, dispatches)) => {
                    info!(sessions, dispatches, "Sweep expired stale state")
                }
                Err(e) => warn!(error = %e, "Sweep failed"),
            }
        }
    });

    let http_addr = config.http_addr;
    let app_state = AppState {
        bridge,
        connector,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                driver.abort();
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    driver.abort();
    Ok(())
}
