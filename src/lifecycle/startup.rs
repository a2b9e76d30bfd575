//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize subsystems in dependency order
//! - Start background tasks (config watcher, signals, admin API)
//! - Bind the listener and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::admin::{spawn_admin, AdminState};
use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, ConfigError, ProxyConfig};
use crate::health::passive::PatternError;
use crate::http::{HttpServer, ServerError};
use crate::lifecycle::signals::{SignalEvent, Signals};
use crate::lifecycle::Shutdown;
use crate::net::listener::Listener;
use crate::observability::{logging, metrics};
use crate::proxy::ProxyEngine;

/// Fatal startup failures.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("building routing tables: {0}")]
    Tables(#[from] PatternError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("invalid metrics address `{0}`")]
    MetricsAddress(String),
    #[error("installing metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("installing signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("watching config file: {0}")]
    Watcher(#[from] notify::Error),
    #[error("starting admin API: {0}")]
    Admin(#[source] io::Error),
}

/// Run the proxy with the config at `path` until shutdown.
pub async fn run(path: &Path) -> Result<(), StartupError> {
    let config = load_config(path)?;
    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        clusters = config.clusters.len(),
        products = config.products.len(),
        "edge-proxy starting"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr)?;
    }

    let engine = ProxyEngine::from_config(&config)?;
    let shutdown = Shutdown::new();

    let (watcher, reloads) = ConfigWatcher::new(path);
    let reload_tx = watcher.sender();
    let _watch = watcher.run()?;
    let signals = Signals::install().map_err(StartupError::Signals)?;
    tokio::spawn(handle_signals(signals, path.to_path_buf(), reload_tx, shutdown.clone()));

    let server = HttpServer::new(engine.clone(), &config);
    if config.admin.enabled {
        start_admin(&config, engine, &server, &shutdown).await?;
    }

    let listener = Listener::bind(&config.listener)
        .await
        .map_err(ServerError::from)?;
    server.run(listener, reloads, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn start_admin(
    config: &ProxyConfig,
    engine: Arc<ProxyEngine>,
    server: &HttpServer,
    shutdown: &Shutdown,
) -> Result<SocketAddr, StartupError> {
    if config.admin.api_key == "CHANGE_ME_IN_PRODUCTION" {
        tracing::warn!("Admin API enabled with the default api key");
    }
    let state = AdminState {
        engine,
        connections: server.tracker().clone(),
        api_key: Arc::from(config.admin.api_key.as_str()),
        started: Instant::now(),
    };
    spawn_admin(&config.admin, state, shutdown.clone())
        .await
        .map_err(StartupError::Admin)
}

async fn handle_signals(
    mut signals: Signals,
    path: PathBuf,
    reloads: mpsc::UnboundedSender<ProxyConfig>,
    shutdown: Shutdown,
) {
    let mut stopping = false;
    loop {
        match signals.recv().await {
            SignalEvent::Shutdown if stopping => {
                tracing::warn!("Second shutdown signal, exiting immediately");
                std::process::exit(1);
            }
            SignalEvent::Shutdown => {
                tracing::info!("Shutdown signal received");
                stopping = true;
                shutdown.trigger();
            }
            SignalEvent::Reload => match load_config(&path) {
                Ok(config) => {
                    tracing::info!("SIGHUP received, reloading config");
                    let _ = reloads.send(config);
                }
                Err(e) => tracing::error!(error = %e, "SIGHUP reload failed, keeping current configuration"),
            },
        }
    }
}
