//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Cluster resolved → BalancerTable::get(cluster name)
//!     → Balancer::balance(req)
//!         → pool.rs (primary or failover backends, available only,
//!                    last failed backend skipped when possible)
//!         → Apply load balancing algorithm:
//!             - round_robin.rs (weighted rotation)
//!             - least_conn.rs (fewest active connections per weight)
//!     → Arc<Backend>, or BalanceError::CrossClusterRetry when the primary
//!       pool is exhausted and a failover pool exists
//! ```
//!
//! # Design Decisions
//! - Strategies are stateless apart from their own cursor; backends track
//!   connections and health
//! - Algorithm selection per cluster
//! - Unhealthy backends excluded from selection until their recovery window
//! - A balancer is rebuilt, not mutated, on config reload

pub mod backend;
pub mod least_conn;
pub mod pool;
pub mod round_robin;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::http::request::ProxyRequest;

pub use backend::{Backend, BackendConnectionGuard};
pub use pool::{BalancerTable, ClusterBalancer};

/// Backend selection algorithm of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    LeastConn,
}

impl LbPolicy {
    pub fn strategy(self) -> Box<dyn Strategy> {
        match self {
            LbPolicy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
            LbPolicy::LeastConn => Box::new(least_conn::LeastConnections::new()),
        }
    }
}

/// Picks one backend out of a candidate list.
pub trait Strategy: Send + Sync + fmt::Debug {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}

/// Balancer failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    /// Retry against the failover backends; no network attempt was made.
    #[error("primary backends exhausted, retry on failover cluster")]
    CrossClusterRetry,
    #[error("no available backend in cluster `{0}`")]
    NoBackend(String),
}

/// Selects a backend for a request of one cluster.
pub trait Balancer: Send + Sync + fmt::Debug {
    fn balance(&self, req: &ProxyRequest) -> Result<Arc<Backend>, BalanceError>;

    /// Every backend, for status reporting.
    fn backends(&self) -> Vec<Arc<Backend>>;
}
