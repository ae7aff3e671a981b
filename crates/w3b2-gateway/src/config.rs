//! Gateway configuration loaded from environment variables.
//!
//! Every setting has a default so the gateway starts with zero configuration
//! for local development. Invalid values are logged and replaced by the
//! default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use w3b2_engine::{EngineConfig, MasterKey};
use w3b2_shared::constants::DEFAULT_HTTP_PORT;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./w3b2_data/bridge.db`
    pub database_path: PathBuf,

    /// Master key the per-relationship ChainCards are sealed under, derived
    /// from a passphrase.
    /// Env: `KEYSTORE_PASSPHRASE`
    /// Default: none, an ephemeral key is generated at startup.
    pub keystore_key: Option<MasterKey>,

    /// Bearer token for operator endpoints such as `/admin/resync`.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (operator API disabled).
    pub admin_token: Option<String>,

    /// How often idle sessions and overdue confirmations are swept.
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: `5`
    pub sweep_interval: Duration,

    /// Env: `SESSION_IDLE_SECS`, `CONFIRMATION_TIMEOUT_SECS`,
    /// `BACKOFF_INITIAL_MS`, `BACKOFF_MAX_MS`, `NOTIFICATION_BUFFER`,
    /// `APPLY_BATCH_SIZE`
    pub engine: EngineConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./w3b2_data/bridge.db"),
            keystore_key: None,
            admin_token: None,
            sweep_interval: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parsed(&var, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = var("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = PathBuf::from(path);
        }

        if let Some(passphrase) = var("KEYSTORE_PASSPHRASE") {
            if passphrase.is_empty() {
                tracing::warn!("Empty KEYSTORE_PASSPHRASE, an ephemeral key will be used");
            } else {
                config.keystore_key = Some(MasterKey::from_passphrase(&passphrase));
            }
        }

        if let Some(token) = var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(secs) = parsed::<u64>(&var, "SWEEP_INTERVAL_SECS").filter(|s| *s > 0) {
            config.sweep_interval = Duration::from_secs(secs);
        }

        let engine = &mut config.engine;
        if let Some(secs) = parsed(&var, "SESSION_IDLE_SECS") {
            engine.session_idle = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&var, "CONFIRMATION_TIMEOUT_SECS") {
            engine.confirmation_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parsed(&var, "BACKOFF_INITIAL_MS") {
            engine.backoff_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed(&var, "BACKOFF_MAX_MS") {
            engine.backoff_max = Duration::from_millis(ms);
        }
        if let Some(n) = parsed(&var, "NOTIFICATION_BUFFER") {
            engine.notification_buffer = n;
        }
        if let Some(n) = parsed(&var, "APPLY_BATCH_SIZE") {
            engine.apply_batch_size = n;
        }
        if engine.backoff_max < engine.backoff_initial {
            tracing::warn!("BACKOFF_MAX_MS below BACKOFF_INITIAL_MS, raising it");
            engine.backoff_max = engine.backoff_initial;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(value = %raw, "Invalid {name}, using default");
            None
        }
    }
}
