//! HTTP/1.1 and h2c transport.
//!
//! # Responsibilities
//! - Own one pooled `hyper_util` client per cluster
//! - Enforce the connect and response-header timeouts
//! - Reduce hyper/io failures to a `TransportErrorKind`

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Response, Version};
use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::http::request::OutRequest;
use crate::transport::{
    BackendProtocol, Transport, TransportError, TransportErrorKind, TransportSettings,
};

/// Pooled HTTP client for one cluster.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    version: Version,
    response_header_timeout: Duration,
}

impl HttpTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(settings.connect_timeout));
        connector.set_nodelay(true);

        let max_idle = if settings.pool.disable_keep_alive {
            0
        } else {
            settings.pool.max_idle_per_host
        };

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(settings.pool.idle_timeout_secs))
            .pool_max_idle_per_host(max_idle);

        let version = if settings.protocol == BackendProtocol::H2c {
            builder.http2_only(true);
            Version::HTTP_2
        } else {
            Version::HTTP_11
        };

        Self {
            client: builder.build(connector),
            version,
            response_header_timeout: settings.response_header_timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, req: &OutRequest) -> Result<Response<Body>, TransportError> {
        let Some(addr) = req.backend else {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                "request is not bound to a backend",
            ));
        };
        let request = req
            .to_http(addr, self.version)
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

        match tokio::time::timeout(self.response_header_timeout, self.client.request(request)).await
        {
            Err(_) => Err(TransportError::new(
                TransportErrorKind::ResponseHeaderTimeout,
                format!(
                    "no response header from {} within {:?}",
                    addr, self.response_header_timeout
                ),
            )),
            Ok(Err(e)) => Err(TransportError::new(classify(&e), error_chain(&e))),
            Ok(Ok(resp)) => Ok(resp.map(Body::new)),
        }
    }
}

/// Map a client error onto the retry taxonomy.
fn classify(err: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if err.is_connect() {
        return TransportErrorKind::Connect;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(e) = cause.downcast_ref::<hyper::Error>() {
            if e.is_timeout() {
                return TransportErrorKind::ResponseHeaderTimeout;
            }
            if e.is_body_write_aborted() || e.is_user() {
                return TransportErrorKind::WriteRequest;
            }
            if e.is_canceled() || e.is_closed() {
                return TransportErrorKind::Broken;
            }
            if e.is_incomplete_message() || e.is_parse() || e.is_parse_status() {
                return TransportErrorKind::ReadResponseHeader;
            }
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            return match e.kind() {
                io::ErrorKind::BrokenPipe => TransportErrorKind::WriteRequest,
                io::ErrorKind::TimedOut => TransportErrorKind::ResponseHeaderTimeout,
                _ => TransportErrorKind::ReadResponseHeader,
            };
        }
        source = cause.source();
    }
    TransportErrorKind::Other
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
