//! Backend transports.
//!
//! # Data Flow
//! ```text
//! BackendInvoker
//!     → cache.rs (cluster name → Arc<dyn Transport>, built lazily)
//!     → Transport::round_trip(OutRequest)
//!         - http.rs (pooled HTTP/1.1 client, or prior-knowledge h2c)
//!         - fcgi.rs (FastCGI responder client)
//!     → Response<Body> or TransportError { kind, .. }
//! ```
//!
//! # Design Decisions
//! - Every failure is reduced to a closed `TransportErrorKind`; retry
//!   eligibility is decided from the kind alone (see resilience::retries)
//! - A transport is immutable once published. Settings changes build a
//!   new one; requests in flight keep the old `Arc` alive until they finish
//! - `TransportSettings` is the single equality used to decide reuse

pub mod cache;
pub mod fcgi;
pub mod http;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Response;
use serde::{Deserialize, Serialize};

use crate::config::schema::{FcgiConfig, PoolConfig};
use crate::http::request::OutRequest;
use crate::proxy::error::ErrorCode;

pub use cache::TransportCache;

/// Protocol spoken to a cluster's backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    #[default]
    Http,
    H2c,
    Fcgi,
}

impl BackendProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendProtocol::Http => "http",
            BackendProtocol::H2c => "h2c",
            BackendProtocol::Fcgi => "fcgi",
        }
    }
}

/// Where a forwarding attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The backend connection could not be established.
    Connect,
    /// Sending the request head or body failed.
    WriteRequest,
    /// The backend closed or garbled the response header.
    ReadResponseHeader,
    /// No response header within the cluster's timeout.
    ResponseHeaderTimeout,
    /// A pooled connection turned out to be unusable.
    Broken,
    Other,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::WriteRequest => "write_request",
            TransportErrorKind::ReadResponseHeader => "read_response_header",
            TransportErrorKind::ResponseHeaderTimeout => "response_header_timeout",
            TransportErrorKind::Broken => "transport_broken",
            TransportErrorKind::Other => "other",
        }
    }

    /// Code recorded on the request when an attempt fails this way.
    pub fn error_code(self) -> ErrorCode {
        match self {
            TransportErrorKind::Connect => ErrorCode::ConnectBackend,
            TransportErrorKind::WriteRequest => ErrorCode::WriteBackend,
            TransportErrorKind::ReadResponseHeader => ErrorCode::ReadBackendHeader,
            TransportErrorKind::ResponseHeaderTimeout => ErrorCode::BackendHeaderTimeout,
            TransportErrorKind::Broken => ErrorCode::TransportBroken,
            TransportErrorKind::Other => ErrorCode::BackendOther,
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed round trip.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A protocol-specific round tripper bound to one cluster.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send `req` to the backend named by its URI authority and return the
    /// response once its header has arrived. The body streams afterwards.
    async fn round_trip(&self, req: &OutRequest) -> Result<Response<Body>, TransportError>;
}

/// Everything a transport is built from.
///
/// Two clusters with equal settings could share a transport; a cluster
/// whose settings changed must get a new one. Adding a field here makes it
/// participate in that decision automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub protocol: BackendProtocol,
    pub connect_timeout: Duration,
    pub response_header_timeout: Duration,
    pub pool: PoolConfig,
    pub fcgi: FcgiConfig,
}

/// Build a fresh transport for `settings`.
pub fn build_transport(settings: &TransportSettings) -> Arc<dyn Transport> {
    match settings.protocol {
        BackendProtocol::Http | BackendProtocol::H2c => {
            Arc::new(http::HttpTransport::new(settings))
        }
        BackendProtocol::Fcgi => Arc::new(fcgi::FcgiTransport::new(settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TransportSettings {
        TransportSettings {
            protocol: BackendProtocol::Http,
            connect_timeout: Duration::from_secs(1),
            response_header_timeout: Duration::from_secs(5),
            pool: PoolConfig::default(),
            fcgi: FcgiConfig::default(),
        }
    }

    #[test]
    fn every_field_takes_part_in_equality() {
        let base = settings();
        assert_eq!(base, settings());

        let mut changed = settings();
        changed.protocol = BackendProtocol::H2c;
        assert_ne!(base, changed);

        let mut changed = settings();
        changed.connect_timeout = Duration::from_millis(1500);
        assert_ne!(base, changed);

        let mut changed = settings();
        changed.response_header_timeout = Duration::from_secs(6);
        assert_ne!(base, changed);

        let mut changed = settings();
        changed.pool.max_idle_per_host += 1;
        assert_ne!(base, changed);

        let mut changed = settings();
        changed.pool.idle_timeout_secs += 1;
        assert_ne!(base, changed);

        let mut changed = settings();
        changed.pool.disable_keep_alive = true;
        assert_ne!(base, changed);

        let mut changed = settings();
        changed.fcgi.root = "/srv".into();
        assert_ne!(base, changed);

        let mut changed = settings();
        changed.fcgi.env.insert("APP_ENV".into(), "prod".into());
        assert_ne!(base, changed);
    }

    #[test]
    fn error_kinds_map_to_request_codes() {
        assert_eq!(
            TransportErrorKind::Connect.error_code(),
            ErrorCode::ConnectBackend
        );
        assert_eq!(
            TransportErrorKind::ResponseHeaderTimeout.error_code(),
            ErrorCode::BackendHeaderTimeout
        );
        assert_eq!(TransportErrorKind::Broken.as_str(), "transport_broken");
    }
}
