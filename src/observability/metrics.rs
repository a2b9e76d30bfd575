//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Install the Prometheus exporter
//! - Record per-request counters and latency
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by cluster, status, error
//! - `proxy_request_duration_seconds` (histogram): end-to-end latency
//! - `proxy_backend_latency_seconds` (histogram): first attempt to last response
//! - `proxy_backend_attempt_seconds` (histogram): the last attempt alone,
//!   so retry time can be told apart from backend latency
//! - `proxy_active_connections` (gauge): current client connections
//! - `proxy_backend_errors_total`, `proxy_retries_total`,
//!   `proxy_cross_cluster_retries_total`, `proxy_requests_with_retry_total`,
//!   `proxy_filter_aborts_total`, `proxy_panics_total`,
//!   `proxy_client_write_failures_total` (counters), recorded where they happen
//!
//! # Design Decisions
//! - Every other subsystem uses the `metrics` macros directly; only the
//!   exporter and the per-request summary live here

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::http::request::ProxyRequest;

/// Serve Prometheus metrics on `addr`. Must run inside the tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record the summary metrics of a finished request.
pub fn record_request(req: &ProxyRequest, cluster: &str, status: Option<u16>, elapsed: Duration) {
    let status = status.map_or_else(|| "closed".to_string(), |s| s.to_string());
    let error = req.error.as_ref().map_or("none", |e| e.code.as_str());
    ::metrics::counter!(
        "proxy_requests_total",
        "cluster" => cluster.to_string(),
        "status" => status,
        "error" => error
    )
    .increment(1);
    ::metrics::histogram!("proxy_request_duration_seconds", "cluster" => cluster.to_string())
        .record(elapsed.as_secs_f64());

    if let Some(total) = req.stat.backend_total() {
        ::metrics::histogram!("proxy_backend_latency_seconds", "cluster" => cluster.to_string())
            .record(total.as_secs_f64());
    }
    if let Some(attempt) = req.stat.last_attempt() {
        ::metrics::histogram!("proxy_backend_attempt_seconds", "cluster" => cluster.to_string())
            .record(attempt.as_secs_f64());
    }
}
