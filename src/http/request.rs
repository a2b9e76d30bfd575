//! Request handling and transformation.
//!
//! # Responsibilities
//! - Carry one request through the pipeline: routing results, retry
//!   counters, timestamps, the error slot and the filter context
//! - Buffer the client body under a size limit and read deadline
//! - Prepare the outbound copy forwarded to backends
//!
//! # Design Decisions
//! - Request ID taken from `X-Request-Id` when present, else a UUID v4
//! - The original head is preserved for logging; a modified copy is
//!   forwarded
//! - The outbound body is buffered so every retry sends identical bytes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, Uri, Version};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};

use crate::filter::context::Context;
use crate::http::response::strip_hop_headers;
use crate::load_balancer::{Backend, BackendConnectionGuard};
use crate::net::connection::ConnectionInfo;
use crate::proxy::error::{ErrorCode, RequestError};
use crate::transport::Transport;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Routing results.
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    pub product: Option<String>,
    pub cluster_name: Option<String>,
}

/// Per-phase timestamps.
#[derive(Debug, Clone)]
pub struct RequestStat {
    pub read_req_start: Instant,
    pub read_req_end: Option<Instant>,
    /// Start of the first backend attempt.
    pub backend_first: Option<Instant>,
    /// Start of the current backend attempt.
    pub backend_start: Option<Instant>,
    pub backend_end: Option<Instant>,
    pub response_start: Option<Instant>,
    pub response_end: Option<Instant>,
}

impl RequestStat {
    fn new() -> Self {
        Self {
            read_req_start: Instant::now(),
            read_req_end: None,
            backend_first: None,
            backend_start: None,
            backend_end: None,
            response_start: None,
            response_end: None,
        }
    }

    /// Duration of the last backend attempt.
    pub fn last_attempt(&self) -> Option<Duration> {
        match (self.backend_start, self.backend_end) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }

    /// From the first backend attempt to the end of the last one,
    /// including every retry.
    pub fn backend_total(&self) -> Option<Duration> {
        match (self.backend_first, self.backend_end) {
            (Some(first), Some(end)) => Some(end.saturating_duration_since(first)),
            _ => None,
        }
    }
}

/// Client body, streaming until buffered.
#[derive(Debug)]
pub enum RequestBody {
    Streaming(Body),
    Buffered(Bytes),
}

/// Why the client body could not be buffered.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("timed out reading client body")]
    Timeout,
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("reading client body: {0}")]
    Read(String),
}

/// The backend and transport a request is currently bound to.
#[derive(Debug)]
pub struct BackendTrans {
    pub guard: BackendConnectionGuard,
    pub transport: Arc<dyn Transport>,
}

#[cfg(test)]
impl BackendTrans {
    pub(crate) fn for_test(backend: &Arc<Backend>) -> Self {
        let cluster = crate::routing::Cluster::from_config(&Default::default(), &Default::default())
            .unwrap_or_else(|e| panic!("default cluster: {e}"));
        Self {
            guard: backend.connection_guard(),
            transport: crate::transport::build_transport(&cluster.transport),
        }
    }
}

/// A request being proxied.
#[derive(Debug)]
pub struct ProxyRequest {
    pub id: String,
    pub conn: ConnectionInfo,
    pub head: Parts,
    pub body: RequestBody,
    pub route: RouteInfo,
    /// Retries so far; only ever increases.
    pub retry_time: u32,
    /// Set once the balancer moved this request to the failover pool.
    pub cross_cluster_retry: bool,
    pub stat: RequestStat,
    pub error: Option<RequestError>,
    pub out_request: Option<OutRequest>,
    pub trans: Option<BackendTrans>,
    pub context: Context,
}

impl ProxyRequest {
    pub fn new(req: Request<Body>, conn: ConnectionInfo) -> Self {
        let (head, body) = req.into_parts();
        let id = head
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            id,
            conn,
            head,
            body: RequestBody::Streaming(body),
            route: RouteInfo::default(),
            retry_time: 0,
            cross_cluster_retry: false,
            stat: RequestStat::new(),
            error: None,
            out_request: None,
            trans: None,
            context: Context::default(),
        }
    }

    pub fn set_error(&mut self, code: ErrorCode, msg: impl Into<String>) {
        self.error = Some(RequestError {
            code,
            msg: msg.into(),
        });
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Read the whole client body, bounded by `limit` bytes and the
    /// client read deadline.
    pub async fn buffer_body(&mut self, limit: usize) -> Result<(), BodyError> {
        let body = match std::mem::replace(&mut self.body, RequestBody::Buffered(Bytes::new())) {
            RequestBody::Streaming(body) => body,
            buffered => {
                self.body = buffered;
                return Ok(());
            }
        };

        let read = Limited::new(body, limit).collect();
        let collected = match self.conn.deadline.read_deadline() {
            Some(at) => tokio::time::timeout_at(at, read)
                .await
                .map_err(|_| BodyError::Timeout)?,
            None => read.await,
        };

        match collected {
            Ok(collected) => {
                self.body = RequestBody::Buffered(collected.to_bytes());
                self.stat.read_req_end = Some(Instant::now());
                Ok(())
            }
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(BodyError::TooLarge(limit)),
            Err(e) if is_timeout(e.as_ref()) => Err(BodyError::Timeout),
            Err(e) => Err(BodyError::Read(e.to_string())),
        }
    }

    /// Build the outbound copy: hop-by-hop headers removed, forwarding
    /// headers added, body taken from the buffered client body.
    pub fn build_out_request(&mut self) {
        let mut headers = self.head.headers.clone();
        strip_hop_headers(&mut headers);

        let peer = self.conn.peer.ip().to_string();
        let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {peer}"),
            None => peer,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if !headers.contains_key(HOST) {
            // h2 clients send :authority instead of Host
            if let Some(value) = self
                .head
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            {
                headers.insert(HOST, value);
            }
        }

        let uri = self
            .head
            .uri
            .path_and_query()
            .and_then(|pq| pq.as_str().parse::<Uri>().ok())
            .unwrap_or_else(|| Uri::from_static("/"));
        let body = match &self.body {
            RequestBody::Buffered(bytes) => bytes.clone(),
            RequestBody::Streaming(_) => Bytes::new(),
        };

        let mut out = OutRequest::new(self.head.method.clone(), uri, headers, body);
        out.version = self.head.version;
        self.out_request = Some(out);
    }

    /// Bind the outbound message to `backend`; the previous binding (and
    /// its connection count) is released.
    pub fn bind_backend(&mut self, backend: &Arc<Backend>, transport: Arc<dyn Transport>) {
        if let Some(out) = self.out_request.as_mut() {
            out.set_backend(backend.addr);
        }
        self.trans = Some(BackendTrans {
            guard: backend.connection_guard(),
            transport,
        });
    }

    pub fn backend(&self) -> Option<&Arc<Backend>> {
        self.trans.as_ref().map(|t| t.guard.backend())
    }
}

fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = e.source();
    }
    false
}

/// The message forwarded to a backend.
#[derive(Debug, Clone)]
pub struct OutRequest {
    pub method: Method,
    /// Origin-form target (`/path?query`).
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub backend: Option<SocketAddr>,
}

impl OutRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers,
            body,
            backend: None,
        }
    }

    pub fn set_backend(&mut self, addr: SocketAddr) {
        self.backend = Some(addr);
    }

    /// GET without a body: safe to send again after a partial failure.
    pub fn is_bodyless_get(&self) -> bool {
        self.method == Method::GET && self.body.is_empty()
    }

    /// Absolute-form request for `addr`, spoken as `version`.
    pub fn to_http(&self, addr: SocketAddr, version: Version) -> Result<Request<Full<Bytes>>, axum::http::Error> {
        let target = self.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(format!("http://{addr}{target}"))
            .version(version);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers.clone();
        }
        builder.body(Full::new(self.body.clone()))
    }
}
