//! Admin API.
//!
//! # Data Flow
//! ```text
//! GET /admin/{status,clusters,backends}
//!     → auth.rs (Bearer token)
//!     → handlers.rs (read the engine's current snapshot)
//!     → JSON
//! ```
//!
//! # Design Decisions
//! - Read only; configuration changes go through the config file
//! - Served on its own listener, normally bound to loopback

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::{middleware, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::schema::AdminConfig;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::proxy::ProxyEngine;

use self::auth::admin_auth_middleware;
use self::handlers::{get_backends, get_clusters, get_status};

/// Shared state of the admin handlers.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub engine: Arc<ProxyEngine>,
    pub connections: ConnectionTracker,
    pub api_key: Arc<str>,
    pub started: Instant,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/clusters", get(get_clusters))
        .route("/admin/backends", get(get_backends))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the admin listener and serve it in the background.
pub async fn spawn_admin(config: &AdminConfig, state: AdminState, shutdown: Shutdown) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(&config.bind_address).await?;
    let address = listener.local_addr()?;
    let router = setup_admin_router(state);
    let mut stop = shutdown.subscribe();

    tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "Admin server failed");
        }
    });
    tracing::info!(%address, "Admin API listening");
    Ok(address)
}
