//! Failover and pipeline scenarios driven through `ProxyEngine::serve` with
//! scripted transports, so every backend outcome is deterministic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use bytes::Bytes;
use edge_proxy::config::schema::{ClusterConfig, ProductConfig, RouteConfig, TimeoutConfig};
use edge_proxy::filter::{FilterStage, FilterTable, Outcome};
use edge_proxy::health::state::HealthThresholds;
use edge_proxy::http::request::OutRequest;
use edge_proxy::load_balancer::round_robin::RoundRobin;
use edge_proxy::load_balancer::{Backend, BalancerTable, ClusterBalancer};
use edge_proxy::net::connection::{ConnectionId, ConnectionInfo, Protocol};
use edge_proxy::net::deadline::ConnDeadlines;
use edge_proxy::proxy::RuntimeTables;
use edge_proxy::resilience::timeouts::Timeouts;
use edge_proxy::routing::{Cluster, RouteTable};
use edge_proxy::transport::{Transport, TransportCache, TransportError, TransportErrorKind};
use edge_proxy::ProxyEngine;
use http_body_util::BodyExt;

/// What a scripted backend does with each attempt.
#[derive(Debug, Clone, Copy)]
enum Script {
    Ok,
    Refuse,
    FailAfterWrite,
    Status(u16),
    Endless,
}

/// Transport that answers according to the backend address.
#[derive(Debug, Default)]
struct Scripted {
    scripts: HashMap<SocketAddr, Script>,
    calls: AtomicUsize,
    body_dropped: Arc<AtomicBool>,
}

struct DropGuard(Arc<AtomicBool>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn round_trip(&self, req: &OutRequest) -> Result<Response<Body>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = req
            .backend
            .and_then(|addr| self.scripts.get(&addr).copied())
            .unwrap_or(Script::Refuse);
        match script {
            Script::Ok => Ok(Response::new(Body::from(format!("served {}", req.uri)))),
            Script::Refuse => Err(TransportError::new(TransportErrorKind::Connect, "connection refused")),
            Script::FailAfterWrite => Err(TransportError::new(
                TransportErrorKind::ReadResponseHeader,
                "backend closed before the response header",
            )),
            Script::Status(code) => Ok(Response::builder()
                .status(code)
                .body(Body::from("backend status"))
                .unwrap()),
            Script::Endless => {
                let guard = DropGuard(self.body_dropped.clone());
                let stream = futures_util::stream::unfold((guard, false), |(guard, sent)| async move {
                    if sent {
                        futures_util::future::pending::<()>().await;
                        None
                    } else {
                        Some((Ok::<_, std::io::Error>(Bytes::from_static(b"first chunk")), (guard, true)))
                    }
                });
                Ok(Response::new(Body::from_stream(stream)))
            }
        }
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

/// Backends that stay in rotation for the whole test.
fn backend(port: u16) -> Arc<Backend> {
    let thresholds = HealthThresholds {
        failure: 100,
        ..HealthThresholds::default()
    };
    Arc::new(Backend::new(format!("b{port}"), addr(port), 1, thresholds))
}

struct Harness {
    engine: Arc<ProxyEngine>,
    transport: Arc<Scripted>,
    backends: Vec<Arc<Backend>>,
    retries_seen: Arc<Mutex<Vec<u32>>>,
}

fn harness(
    scripts: &[(u16, Script)],
    cluster: ClusterConfig,
    configure: impl FnOnce(&mut FilterTable),
) -> Harness {
    let transport = Arc::new(Scripted {
        scripts: scripts.iter().map(|(port, s)| (addr(*port), *s)).collect(),
        ..Default::default()
    });
    let backends: Vec<_> = scripts.iter().map(|(port, _)| backend(*port)).collect();

    let name = cluster.name.clone();
    let cluster = Arc::new(Cluster::from_config(&cluster, &TimeoutConfig::default()).unwrap());
    let products = vec![ProductConfig {
        name: "site".into(),
        hosts: vec!["*".into()],
        routes: vec![RouteConfig {
            name: "all".into(),
            host: None,
            path_prefix: Some("/".into()),
            header: None,
            cluster: name.clone(),
            priority: 0,
        }],
    }];

    let mut balancers = BalancerTable::new();
    balancers.insert(
        name.clone(),
        Arc::new(ClusterBalancer::new(
            name,
            backends.clone(),
            vec![],
            Box::new(RoundRobin::new()),
        )),
    );

    let retries_seen = Arc::new(Mutex::new(Vec::new()));
    let mut filters = FilterTable::new();
    configure(&mut filters);
    let seen = retries_seen.clone();
    filters.register_fn(FilterStage::RequestFinish, "record_retries", move |req, _| {
        seen.lock().unwrap().push(req.retry_time);
        Outcome::GoOn
    });

    let tables = RuntimeTables {
        resolver: Arc::new(RouteTable::new(&products, vec![cluster.clone()])),
        clusters: vec![cluster],
        balancers,
        filters,
        timeouts: Timeouts::default(),
        max_body_bytes: 64 * 1024,
    };
    let factory_transport = transport.clone();
    let engine = ProxyEngine::new(
        tables,
        TransportCache::with_factory(Arc::new(move |_| factory_transport.clone() as Arc<dyn Transport>)),
    );

    Harness {
        engine,
        transport,
        backends,
        retries_seen,
    }
}

fn web_cluster() -> ClusterConfig {
    ClusterConfig {
        name: "web".into(),
        flush_interval_ms: -1,
        cancel_on_client_close: true,
        ..Default::default()
    }
}

fn connection() -> (ConnectionInfo, Arc<ConnDeadlines>) {
    let deadlines = ConnDeadlines::new();
    let conn = ConnectionInfo {
        id: ConnectionId::new(),
        peer: SocketAddr::from(([192, 0, 2, 10], 50000)),
        protocol: Protocol::Http1,
        deadline: deadlines.clone(),
    };
    (conn, deadlines)
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::HOST, "example.com")
        .body(Body::empty())
        .unwrap()
}

async fn body_text(resp: Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

impl Harness {
    fn calls(&self) -> usize {
        self.transport.calls.load(Ordering::SeqCst)
    }

    fn last_retry_time(&self) -> Option<u32> {
        self.retries_seen.lock().unwrap().last().copied()
    }
}

#[tokio::test]
async fn first_attempt_success_needs_no_retry() {
    let h = harness(&[(1, Script::Ok)], web_cluster(), |_| {});
    let (conn, _) = connection();

    let resp = h.engine.serve(get("/index.html"), conn).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "served /index.html");

    assert_eq!(h.calls(), 1);
    assert_eq!(h.last_retry_time(), Some(0));
    assert_eq!(h.backends[0].success_total(), 1);
    assert_eq!(h.backends[0].failure_total(), 0);
}

#[tokio::test]
async fn connect_error_fails_over_to_next_backend() {
    let h = harness(&[(1, Script::Refuse), (2, Script::Ok)], web_cluster(), |_| {});
    let (conn, deadlines) = connection();

    let resp = h.engine.serve(get("/"), conn).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    body_text(resp).await;

    assert_eq!(h.calls(), 2);
    assert_eq!(h.last_retry_time(), Some(1));
    assert_eq!(h.backends[0].failure_total(), 1);
    assert_eq!(h.backends[1].success_total(), 1);
    assert!(!deadlines.is_closing());
}

#[tokio::test]
async fn redirect_filter_skips_the_backend() {
    let h = harness(&[(1, Script::Ok)], web_cluster(), |filters| {
        filters.register_fn(FilterStage::BeforeLocation, "moved", |req, _| {
            if req.head.uri.path().starts_with("/old") {
                Outcome::redirect("https://example.com/new", StatusCode::MOVED_PERMANENTLY)
            } else {
                Outcome::GoOn
            }
        });
    });
    let (conn, _) = connection();

    let resp = h.engine.serve(get("/old/page"), conn).await.unwrap();
    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(resp.headers()[header::LOCATION], "https://example.com/new");
    body_text(resp).await;

    assert_eq!(h.calls(), 0);
}

#[tokio::test]
async fn failure_after_write_is_not_retried_without_idempotent_level() {
    let mut cluster = web_cluster();
    cluster.retry_level = edge_proxy::resilience::retries::RetryLevel::None;
    let h = harness(&[(1, Script::FailAfterWrite), (2, Script::Ok)], cluster, |_| {});
    let (conn, deadlines) = connection();

    let resp = h.engine.serve(get("/"), conn).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    body_text(resp).await;

    assert_eq!(h.calls(), 1);
    assert_eq!(h.last_retry_time(), Some(0));
    tokio::time::timeout(Duration::from_secs(1), deadlines.closing())
        .await
        .expect("connection should close after the error reply");
}

#[tokio::test]
async fn bodyless_get_retries_after_write_with_idempotent_level() {
    let h = harness(&[(1, Script::FailAfterWrite), (2, Script::Ok)], web_cluster(), |_| {});
    let (conn, _) = connection();

    let resp = h.engine.serve(get("/"), conn).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    body_text(resp).await;

    assert_eq!(h.calls(), 2);
    assert_eq!(h.last_retry_time(), Some(1));
}

#[tokio::test]
async fn post_with_body_is_never_retried_after_write() {
    let h = harness(&[(1, Script::FailAfterWrite), (2, Script::Ok)], web_cluster(), |_| {});
    let (conn, _) = connection();
    let req = Request::builder()
        .method("POST")
        .uri("/submit")
        .header(header::HOST, "example.com")
        .body(Body::from("payload"))
        .unwrap();

    let resp = h.engine.serve(req, conn).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    body_text(resp).await;
    assert_eq!(h.calls(), 1);
}

#[tokio::test]
async fn connect_errors_stop_at_twenty_attempts() {
    let h = harness(&[(1, Script::Refuse)], web_cluster(), |_| {});
    let (conn, _) = connection();

    let resp = h.engine.serve(get("/"), conn).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    body_text(resp).await;

    assert_eq!(h.calls(), 20);
    assert_eq!(h.last_retry_time(), Some(19));
}

#[tokio::test]
async fn outlier_status_is_forwarded_and_counted_against_backend() {
    let h = harness(&[(1, Script::Status(503))], web_cluster(), |_| {});
    let (conn, _) = connection();

    let resp = h.engine.serve(get("/"), conn).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(resp).await, "backend status");

    assert_eq!(h.calls(), 1);
    assert_eq!(h.backends[0].failure_total(), 1);
}

#[tokio::test]
async fn client_disconnect_releases_backend_body() {
    let h = harness(&[(1, Script::Endless)], web_cluster(), |_| {});
    let (conn, deadlines) = connection();
    let dropped = h.transport.body_dropped.clone();

    let resp = h.engine.serve(get("/stream"), conn).await.unwrap();
    let mut body = resp.into_body();
    let first = body.frame().await.unwrap().unwrap();
    assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"first chunk"));
    drop(body);

    tokio::time::timeout(Duration::from_secs(1), async {
        while !dropped.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backend body should be dropped");
    tokio::time::timeout(Duration::from_secs(1), deadlines.closing())
        .await
        .expect("connection should be closed after a broken stream");
}

#[tokio::test]
async fn pass_through_filters_leave_response_unchanged() {
    let plain = harness(&[(1, Script::Ok)], web_cluster(), |_| {});
    let filtered = harness(&[(1, Script::Ok)], web_cluster(), |filters| {
        for stage in [
            FilterStage::BeforeLocation,
            FilterStage::AfterLocation,
            FilterStage::HandleForward,
            FilterStage::ReadResponse,
        ] {
            filters.register_fn(stage, "noop", |_, _| Outcome::GoOn);
        }
    });

    let (conn, _) = connection();
    let a = plain.engine.serve(get("/same"), conn).await.unwrap();
    let (conn, _) = connection();
    let b = filtered.engine.serve(get("/same"), conn).await.unwrap();

    assert_eq!(a.status(), b.status());
    assert_eq!(body_text(a).await, body_text(b).await);
}
