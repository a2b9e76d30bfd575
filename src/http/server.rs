//! HTTP server: accept loop and per-connection tasks.
//!
//! # Responsibilities
//! - Accept connections under the listener's connection limit
//! - Serve each connection with hyper (HTTP/1.1 and h2c on one port)
//! - Wire connection deadlines into the socket and the request pipeline
//! - Apply config reloads and coordinate graceful shutdown
//!
//! # Design Decisions
//! - One task per connection; requests on an HTTP/1 connection are served
//!   one after another, h2 streams concurrently
//! - A close requested by the engine becomes `graceful_shutdown`, so the
//!   in-flight response is finished before the socket closes
//! - Shutdown stops accepting, marks the engine draining and waits for
//!   open connections up to the graceful timeout

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ProxyConfig;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionInfo, ConnectionTracker, Protocol};
use crate::net::deadline::{self, ClientDeadline, ConnDeadlines, DeadlineIo};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::proxy::ProxyEngine;

/// Server failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// The client-facing HTTP server.
#[derive(Debug)]
pub struct HttpServer {
    engine: Arc<ProxyEngine>,
    tracker: ConnectionTracker,
    /// Idle allowance before the first request of a connection.
    first_request_timeout: Option<Duration>,
    graceful_timeout: Duration,
}

impl HttpServer {
    pub fn new(engine: Arc<ProxyEngine>, config: &ProxyConfig) -> Self {
        let read_again = Duration::from_millis(config.timeouts.read_client_again_ms);
        Self {
            engine,
            tracker: ConnectionTracker::new(),
            first_request_timeout: (!read_again.is_zero()).then_some(read_again),
            graceful_timeout: Duration::from_secs(config.listener.graceful_timeout_secs),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve until `shutdown` fires, applying configs received on `reloads`.
    pub async fn run(
        self,
        listener: Listener,
        mut reloads: mpsc::UnboundedReceiver<ProxyConfig>,
        shutdown: Shutdown,
    ) -> Result<(), ServerError> {
        let mut stop = shutdown.subscribe();
        let mut reloads_open = true;
        if let Ok(address) = listener.local_addr() {
            tracing::info!(%address, "HTTP server starting");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => self.spawn_connection(stream, peer, permit, &shutdown),
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    Err(e) => return Err(e.into()),
                },
                reload = reloads.recv(), if reloads_open => match reload {
                    Some(config) => {
                        if let Err(e) = self.engine.reload(&config) {
                            tracing::error!(error = %e, "Rejected config reload");
                        }
                    }
                    None => reloads_open = false,
                },
                _ = stop.recv() => break,
            }
        }

        self.engine.set_draining(true);
        tracing::info!(
            active = self.tracker.active_count(),
            timeout_secs = self.graceful_timeout.as_secs(),
            "Draining connections"
        );
        if tokio::time::timeout(self.graceful_timeout, self.tracker.wait_for_drain())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Graceful timeout elapsed with open connections"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit, shutdown: &Shutdown) {
        let guard = self.tracker.track();
        let conn_id = guard.id();
        let engine = self.engine.clone();
        let mut stop = shutdown.subscribe();
        let first_request_timeout = self.first_request_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            let _ = stream.set_nodelay(true);

            let deadlines = ConnDeadlines::new();
            deadlines.set_idle_deadline(first_request_timeout.map(|t| Instant::now() + t));
            let io = TokioIo::new(DeadlineIo::new(stream, deadlines.clone()));

            let service_deadlines = deadlines.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let engine = engine.clone();
                let deadlines = service_deadlines.clone();
                async move {
                    deadlines.set_idle_deadline(None);
                    let protocol = Protocol::from_version(req.version());
                    let conn = ConnectionInfo {
                        id: conn_id,
                        peer,
                        protocol,
                        deadline: deadline::for_request(protocol, &deadlines),
                    };
                    engine.serve(req.map(Body::new), conn).await
                }
            });

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder.http1().timer(TokioTimer::new());
            builder.http2().timer(TokioTimer::new());
            let conn = builder.serve_connection(io, service);
            tokio::pin!(conn);

            let mut stopping = false;
            let mut closing = false;
            loop {
                tokio::select! {
                    res = conn.as_mut() => {
                        if let Err(e) = res {
                            tracing::debug!(conn_id = %conn_id, %peer, error = %e, "Connection ended with error");
                        }
                        break;
                    }
                    _ = stop.recv(), if !stopping => {
                        stopping = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    _ = deadlines.closing(), if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
            tracing::debug!(conn_id = %conn_id, %peer, "Connection closed");
        });
    }
}
