//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server
//! - Track active connections (for Least Connections LB)
//! - Track health state via success/failure feedback

use std::net::{AddrParseError, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::health::state::{HealthState, HealthThresholds, HealthTracker};

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub addr: SocketAddr,
    pub weight: u32,
    /// Requests currently bound to this backend.
    active_connections: AtomicUsize,
    health: HealthTracker,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl Backend {
    pub fn new(name: impl Into<String>, addr: SocketAddr, weight: u32, thresholds: HealthThresholds) -> Self {
        Self {
            name: name.into(),
            addr,
            weight: weight.max(1),
            active_connections: AtomicUsize::new(0),
            health: HealthTracker::new(thresholds),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &BackendConfig, thresholds: HealthThresholds) -> Result<Self, AddrParseError> {
        let addr: SocketAddr = config.address.parse()?;
        let name = config.name.clone().unwrap_or_else(|| config.address.clone());
        Ok(Self::new(name, addr, config.weight, thresholds))
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Count a request as bound to this backend until the guard drops.
    pub fn connection_guard(self: &Arc<Self>) -> BackendConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        BackendConnectionGuard {
            backend: self.clone(),
        }
    }

    // --- Health Logic ---

    /// True unless the backend is unhealthy and still inside its recovery window.
    pub fn is_available(&self) -> bool {
        self.health.is_available()
    }

    pub fn health_state(&self) -> HealthState {
        self.health.state()
    }

    /// Report a successful request.
    pub fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        if self.health.record_success() {
            tracing::info!(backend = %self.name, addr = %self.addr, "Backend marked healthy");
        }
    }

    /// Report a failed request.
    pub fn on_fail(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if self.health.record_failure() {
            tracing::warn!(backend = %self.name, addr = %self.addr, "Backend marked unhealthy");
            metrics::counter!("proxy_backend_ejections_total", "backend" => self.name.clone())
                .increment(1);
        }
    }

    pub fn success_total(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failure_total(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    backend: Arc<Backend>,
}

impl BackendConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
