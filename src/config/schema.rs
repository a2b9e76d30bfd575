//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::load_balancer::LbPolicy;
use crate::resilience::retries::RetryLevel;
use crate::transport::BackendProtocol;

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Server-wide timeouts, used until a cluster has been resolved.
    pub timeouts: TimeoutConfig,

    /// Products: host groups with their ordered route rules.
    pub products: Vec<ProductConfig>,

    /// Cluster definitions (backends plus forwarding policy).
    pub clusters: Vec<ClusterConfig>,

    /// Built-in filter modules.
    pub modules: ModulesConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Largest request body buffered for forwarding, in bytes.
    pub max_body_bytes: usize,

    /// How long shutdown waits for open connections to drain.
    pub graceful_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            max_body_bytes: 8 * 1024 * 1024,
            graceful_timeout_secs: 30,
        }
    }
}

/// Server timeout configuration, all values in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment.
    pub connect_ms: u64,

    /// Waiting for the backend response header after the request is sent.
    pub response_header_ms: u64,

    /// Reading the client request body.
    pub read_client_ms: u64,

    /// Writing the response to the client.
    pub write_client_ms: u64,

    /// Idle time allowed between requests on a kept-alive connection.
    pub read_client_again_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2_000,
            response_header_ms: 60_000,
            read_client_ms: 30_000,
            write_client_ms: 60_000,
            read_client_again_ms: 60_000,
        }
    }
}

/// Per-cluster timeout overrides. Unset fields inherit the server
/// `[timeouts]` values.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterTimeoutConfig {
    pub connect_ms: Option<u64>,
    pub response_header_ms: Option<u64>,
    pub read_client_ms: Option<u64>,
    pub write_client_ms: Option<u64>,
    pub read_client_again_ms: Option<u64>,
}

impl ClusterTimeoutConfig {
    /// Apply these overrides on top of the server timeouts.
    pub fn merged(&self, server: &TimeoutConfig) -> TimeoutConfig {
        TimeoutConfig {
            connect_ms: self.connect_ms.unwrap_or(server.connect_ms),
            response_header_ms: self.response_header_ms.unwrap_or(server.response_header_ms),
            read_client_ms: self.read_client_ms.unwrap_or(server.read_client_ms),
            write_client_ms: self.write_client_ms.unwrap_or(server.write_client_ms),
            read_client_again_ms: self.read_client_again_ms.unwrap_or(server.read_client_again_ms),
        }
    }
}

/// A product groups hostnames under one set of routing rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProductConfig {
    /// Product identifier for logging/metrics.
    pub name: String,

    /// Hostnames served by this product. `*.example.com` matches any
    /// subdomain; a bare `*` makes this the default product.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Route rules, evaluated by descending priority.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Route rule mapping requests of a product to a cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Header that must be present with the given value.
    pub header: Option<HeaderMatchConfig>,

    /// Cluster name to forward to.
    pub cluster: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Exact header match condition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderMatchConfig {
    pub name: String,
    pub value: String,
}

/// Cluster configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClusterConfig {
    /// Unique cluster name referenced by routes.
    pub name: String,

    /// Protocol spoken to the backends.
    #[serde(default)]
    pub protocol: BackendProtocol,

    /// Which failed attempts may be retried on another backend.
    #[serde(default)]
    pub retry_level: RetryLevel,

    /// Backend selection strategy.
    #[serde(default)]
    pub lb_policy: LbPolicy,

    /// Response flush interval in milliseconds: negative streams every
    /// chunk, zero buffers, positive flushes at most once per interval.
    #[serde(default)]
    pub flush_interval_ms: i64,

    /// Close the backend body as soon as the client goes away.
    #[serde(default)]
    pub cancel_on_client_close: bool,

    #[serde(default)]
    pub timeouts: ClusterTimeoutConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub outlier: OutlierConfig,

    #[serde(default)]
    pub fcgi: FcgiConfig,

    /// Primary backends.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Backends used after the balancer asks for a cross-cluster retry.
    #[serde(default)]
    pub failover_backends: Vec<BackendConfig>,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Backend identifier; defaults to the address.
    pub name: Option<String>,

    /// Backend address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BackendConfig {
    /// Backend with default weight and no explicit name.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
            weight: default_weight(),
        }
    }
}

fn default_weight() -> u32 {
    1
}

/// Idle connection pool settings for a cluster's transport.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per backend.
    pub max_idle_per_host: usize,

    /// How long an idle connection is kept, in seconds.
    pub idle_timeout_secs: u64,

    /// Never reuse backend connections.
    pub disable_keep_alive: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 2,
            idle_timeout_secs: 90,
            disable_keep_alive: false,
        }
    }
}

/// Passive outlier detection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutlierConfig {
    /// Response statuses that count as backend failures, e.g. `"5xx"` or `"429"`.
    pub fail_statuses: Vec<String>,

    /// Consecutive failures before a backend is taken out of rotation.
    pub failure_threshold: u32,

    /// Consecutive successes before it is trusted again.
    pub success_threshold: u32,

    /// Seconds an unhealthy backend waits before it is probed with live traffic.
    pub recovery_secs: u64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            fail_statuses: vec!["5xx".to_string()],
            failure_threshold: 3,
            success_threshold: 1,
            recovery_secs: 10,
        }
    }
}

/// FastCGI specific settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct FcgiConfig {
    /// Document root used to build `SCRIPT_FILENAME`.
    pub root: String,

    /// Extra CGI parameters sent with every request.
    pub env: BTreeMap<String, String>,
}

/// Built-in filter modules.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ModulesConfig {
    /// Path-prefix redirect rules.
    pub redirect: Vec<RedirectRuleConfig>,

    /// Request blocking rules.
    pub block: BlockConfig,

    /// Headers added to every response.
    pub response_headers: BTreeMap<String, String>,
}

/// Redirect requests whose path starts with `prefix`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedirectRuleConfig {
    pub prefix: String,
    pub location: String,
    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

fn default_redirect_status() -> u16 {
    302
}

/// Requests matching these rules have their connection closed.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BlockConfig {
    pub client_ips: Vec<String>,
    pub path_prefixes: Vec<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
