//! Request pipeline and failover engine.
//!
//! # Data Flow
//! ```text
//! HttpServer service_fn
//!     → ProxyEngine::serve(request, connection info)
//!         → spawned task, wrapped in catch_unwind
//!             → pipeline.rs (filter stages, routing, body, invoker)
//!             → response head handed back over a oneshot
//!             → streamer.rs copies the backend body into the client body
//!             → RequestFinish filters
//!             → disposition.rs decides keep-alive / close
//!             → deadlines armed or connection close requested
//! ```
//!
//! # Design Decisions
//! - Routing tables, balancers and filters form one snapshot swapped with
//!   `ArcSwap`; a request keeps the snapshot it started with
//! - The transport cache outlives snapshots and is refreshed on reload
//! - The body is produced by the request task, so RequestFinish and the
//!   connection decision run after the last byte was handed to hyper
//! - A panic in the request task aborts the client body and closes the
//!   connection; it never reaches the connection task

pub mod buffer;
pub mod disposition;
pub mod error;
pub mod invoker;
pub mod pipeline;
pub mod streamer;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::header::{HeaderValue, CONNECTION};
use axum::http::{Request, Response};
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::ProxyConfig;
use crate::filter::{keys, FilterStage, FilterTable};
use crate::health::passive::PatternError;
use crate::http::request::ProxyRequest;
use crate::load_balancer::BalancerTable;
use crate::net::connection::{ConnectionInfo, Protocol};
use crate::observability::metrics as proxy_metrics;
use crate::resilience::timeouts::Timeouts;
use crate::routing::{Cluster, ClusterResolver, RouteTable};
use crate::transport::TransportCache;

use self::buffer::BufferPool;
use self::disposition::{resolve, Action, ResponseSignals};
use self::error::{ErrorCode, ProxyError};
use self::pipeline::Pipeline;
use self::streamer::{client_channel, ClientWriter, FlushInterval, ResponseStreamer, StreamError, StreamOptions};

/// Frames buffered between the request task and hyper.
const BODY_CHANNEL_FRAMES: usize = 8;
const STREAM_BUFFER_SIZE: usize = 32 * 1024;
const MAX_POOLED_BUFFERS: usize = 256;

/// Everything a request reads from configuration, as one snapshot.
#[derive(Debug)]
pub struct RuntimeTables {
    pub resolver: Arc<dyn ClusterResolver>,
    pub clusters: Vec<Arc<Cluster>>,
    pub balancers: BalancerTable,
    pub filters: FilterTable,
    /// Server-wide timeouts, used until a cluster is resolved.
    pub timeouts: Timeouts,
    pub max_body_bytes: usize,
}

impl RuntimeTables {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, PatternError> {
        let routes = RouteTable::from_config(config)?;
        let clusters = routes.clusters().cloned().collect();
        Ok(Self {
            resolver: Arc::new(routes),
            clusters,
            balancers: BalancerTable::from_config(&config.clusters),
            filters: crate::modules::build_filter_table(config),
            timeouts: Timeouts::from(&config.timeouts),
            max_body_bytes: config.listener.max_body_bytes,
        })
    }
}

/// The proxy request engine shared by every connection.
#[derive(Debug)]
pub struct ProxyEngine {
    tables: ArcSwap<RuntimeTables>,
    transports: TransportCache,
    streamer: ResponseStreamer,
    draining: AtomicBool,
}

impl ProxyEngine {
    pub fn new(tables: RuntimeTables, transports: TransportCache) -> Arc<Self> {
        Arc::new(Self {
            tables: ArcSwap::from_pointee(tables),
            transports,
            streamer: ResponseStreamer::new(BufferPool::new(STREAM_BUFFER_SIZE, MAX_POOLED_BUFFERS)),
            draining: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Arc<Self>, PatternError> {
        Ok(Self::new(RuntimeTables::from_config(config)?, TransportCache::new()))
    }

    /// Current snapshot.
    pub fn tables(&self) -> Arc<RuntimeTables> {
        self.tables.load_full()
    }

    pub fn transports(&self) -> &TransportCache {
        &self.transports
    }

    /// Build a new snapshot from `config` and publish it. Requests in
    /// flight finish on the snapshot they started with.
    pub fn reload(&self, config: &ProxyConfig) -> Result<(), PatternError> {
        let tables = RuntimeTables::from_config(config)?;
        self.transports.refresh(tables.clusters.iter().map(|c| c.as_ref()));
        tracing::info!(
            clusters = tables.clusters.len(),
            products = config.products.len(),
            "Routing tables reloaded"
        );
        self.tables.store(Arc::new(tables));
        Ok(())
    }

    /// Mark graceful shutdown; every later response closes its connection.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Run the pipeline for `req` and return the response head. The body
    /// keeps streaming from a background task.
    pub async fn serve(self: &Arc<Self>, req: Request<Body>, conn: ConnectionInfo) -> Result<Response<Body>, ProxyError> {
        let (head_tx, head_rx) = oneshot::channel();
        let (writer, client_body) = client_channel(BODY_CHANNEL_FRAMES);
        let panic_writer = writer.clone();
        let deadline = conn.deadline.clone();
        let conn_id = conn.id;
        let engine = self.clone();

        tokio::spawn(async move {
            let handled = AssertUnwindSafe(engine.handle(req, conn, head_tx, writer, client_body))
                .catch_unwind()
                .await;
            if handled.is_err() {
                tracing::error!(conn_id = %conn_id, "Request handler panicked, closing connection");
                metrics::counter!("proxy_panics_total").increment(1);
                panic_writer.abort("request handler panicked");
                deadline.close_after_reply();
            }
        });

        head_rx.await.unwrap_or(Err(ProxyError::Panicked))
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Body>,
        conn: ConnectionInfo,
        head_tx: oneshot::Sender<Result<Response<Body>, ProxyError>>,
        writer: ClientWriter,
        client_body: Body,
    ) {
        let tables = self.tables.load_full();
        let mut signals = ResponseSignals::from_request(&req, self.is_draining());
        let mut req = ProxyRequest::new(req, conn);
        let deadline = req.conn.deadline.clone();

        let processed = Pipeline::new(&tables, &self.transports).process(&mut req).await;
        let cluster = processed.cluster;
        let timeouts = cluster.as_ref().map_or(tables.timeouts, |c| c.timeouts);

        let Some(mut resp) = processed.response else {
            let _ = head_tx.send(Err(ProxyError::Closed));
            tables.filters.run(FilterStage::RequestFinish, &mut req, None);
            deadline.close_after_reply();
            self.log_request(&req, cluster.as_deref(), None, Action::CloseDirectly, 0);
            return;
        };

        if let Some(extra) = req.context.remove(&keys::RESPONSE_HEADERS) {
            resp.headers_mut().extend(extra);
        }
        signals.observe_response(&resp);
        let mut action = processed.action;
        if resolve(action, Action::KeepAlive, &signals) != Action::KeepAlive && req.conn.protocol == Protocol::Http1 {
            resp.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let status = resp.status();
        let (parts, body) = resp.into_parts();
        let write_deadline = Instant::now() + timeouts.write_client;
        deadline.set_write_deadline(Some(write_deadline));
        req.stat.response_start = Some(std::time::Instant::now());

        let mut sent = 0;
        let mut stream_broken = false;
        if head_tx.send(Ok(Response::from_parts(parts, client_body))).is_err() {
            req.set_error(ErrorCode::WriteClient, "client gone before the response head");
            action = Action::CloseDirectly;
        } else {
            let opts = StreamOptions {
                flush: cluster.as_ref().map_or(FlushInterval::Buffered, |c| c.flush),
                cancel_on_client_close: cluster.as_ref().map_or(true, |c| c.cancel_on_client_close),
                write_deadline: Some(write_deadline),
            };
            match self.streamer.send(&writer, body, &opts).await {
                Ok(bytes) => sent = bytes,
                Err(err) => {
                    let code = match err {
                        StreamError::Backend(_) => ErrorCode::TransportBroken,
                        StreamError::ClientClosed | StreamError::WriteTimeout => {
                            metrics::counter!("proxy_client_write_failures_total").increment(1);
                            ErrorCode::WriteClient
                        }
                    };
                    tracing::info!(request_id = %req.id, error = %err, "Response streaming stopped");
                    req.set_error(code, err.to_string());
                    stream_broken = true;
                    action = Action::CloseDirectly;
                }
            }
        }
        req.stat.response_end = Some(std::time::Instant::now());

        let finish = tables.filters.run(FilterStage::RequestFinish, &mut req, None);
        let action = resolve(action, Action::from_outcome(&finish), &signals);
        match action {
            Action::KeepAlive => {
                deadline.set_write_deadline(None);
                deadline.set_idle_deadline(timeouts.idle().map(|idle| Instant::now() + idle));
            }
            Action::CloseAfterReply => deadline.close_after_reply(),
            Action::CloseDirectly => {
                // a body that was fully streamed still ends cleanly
                if stream_broken {
                    writer.abort("response stream broken");
                }
                drop(writer);
                deadline.close_after_reply();
            }
        }

        self.log_request(&req, cluster.as_deref(), Some(status.as_u16()), action, sent);
    }

    fn log_request(&self, req: &ProxyRequest, cluster: Option<&Cluster>, status: Option<u16>, action: Action, sent: u64) {
        let cluster = cluster.map_or("-", |c| c.name.as_str());
        let elapsed = req.stat.read_req_start.elapsed();
        let backend = req.backend().map(|b| b.addr.to_string());
        let error = req.error.as_ref();
        tracing::info!(
            target: "access",
            request_id = %req.id,
            conn_id = %req.conn.id,
            client = %req.conn.peer,
            method = %req.head.method,
            path = req.head.uri.path(),
            product = req.route.product.as_deref().unwrap_or("-"),
            cluster,
            backend = backend.as_deref().unwrap_or("-"),
            status = status.unwrap_or(0),
            bytes = sent,
            retry_time = req.retry_time,
            error_code = error.map_or("-", |e| e.code.as_str()),
            error = error.map_or("", |e| e.msg.as_str()),
            action = action.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            backend_ms = req.stat.last_attempt().map_or(0, |d| d.as_millis() as u64),
            "request"
        );
        proxy_metrics::record_request(req, cluster, status, elapsed);
    }
}
