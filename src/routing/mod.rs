//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Request (host, path, headers, context overrides)
//!     → ClusterResolver::find_product  (host → product)
//!     → FoundProduct filters
//!     → ClusterResolver::find_cluster  (product routes → cluster name)
//!     → ClusterResolver::lookup        (cluster name → Arc<Cluster>)
//!
//! Route Compilation (at startup and on reload):
//!     ProductConfig[] + ClusterConfig[]
//!     → Sort routes by priority
//!     → Compile matchers
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Routes compiled ahead of time, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route
//! - Routing failures are never retried

pub mod cluster;
pub mod matcher;
pub mod router;

use std::fmt;
use std::sync::Arc;

use crate::http::request::ProxyRequest;
use crate::proxy::error::ErrorCode;

pub use cluster::Cluster;
pub use router::RouteTable;

/// Routing lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no product serves host `{0}`")]
    NoProduct(String),
    #[error("unknown product `{0}`")]
    UnknownProduct(String),
    #[error("cluster lookup before product was resolved")]
    ProductUnresolved,
    #[error("product `{product}` has no route for `{path}`")]
    NoRoute { product: String, path: String },
    #[error("unknown cluster `{0}`")]
    UnknownCluster(String),
}

impl RouteError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RouteError::NoProduct(_) | RouteError::UnknownProduct(_) => ErrorCode::NoProduct,
            _ => ErrorCode::NoCluster,
        }
    }
}

/// Resolves the routing target of a request.
pub trait ClusterResolver: Send + Sync + fmt::Debug {
    /// Set `req.route.product`.
    fn find_product(&self, req: &mut ProxyRequest) -> Result<(), RouteError>;

    /// Set `req.route.cluster_name`.
    fn find_cluster(&self, req: &mut ProxyRequest) -> Result<(), RouteError>;

    fn lookup(&self, cluster: &str) -> Result<Arc<Cluster>, RouteError>;
}
