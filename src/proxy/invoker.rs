//! Backend invocation with retry and failover.
//!
//! # Responsibilities
//! - Pick a backend, run HandleForward, forward, classify the result
//! - Retry on another backend when the failure kind allows it
//! - Feed success/failure back into backend health
//!
//! # Data Flow
//! ```text
//! loop (at most MAX_ATTEMPTS iterations):
//!     Balancer::balance(req)
//!         CrossClusterRetry → retry_time += 1, switch to failover pool, next
//!         other error       → NoBackend, stop
//!     HandleForward filters  → non-GoOn aborts the invocation
//!     TransportCache::get_or_create(cluster) → bind backend + transport
//!     Transport::round_trip(out_request)
//!         Ok  → outlier check → on_fail / on_success, clear error, done
//!         Err → record kind; retry if eligible, else stop
//! ```
//!
//! # Design Decisions
//! - Balancer-level retries make no network attempt but share the
//!   iteration cap with transport retries
//! - The failed backend stays bound until the next pick so the balancer
//!   can steer away from it
//! - Only connect failures count against backend health; a backend that
//!   answered badly is judged by its status through the outlier policy
//! - Header timeouts and broken transports leave health alone: the backend
//!   accepted the request, and a slow path or payload is not proof it is down

use std::time::Instant;

use axum::body::Body;
use axum::http::Response;

use crate::filter::{FilterStage, FilterTable, Outcome};
use crate::http::request::ProxyRequest;
use crate::http::response::strip_hop_headers;
use crate::load_balancer::{BalanceError, BalancerTable};
use crate::proxy::error::{ErrorCode, InvokeError};
use crate::resilience::retries::{is_retry_eligible, MAX_ATTEMPTS};
use crate::routing::Cluster;
use crate::transport::{TransportError, TransportErrorKind, TransportCache};

/// Successful end of an invocation.
#[derive(Debug)]
pub enum Invocation {
    /// The backend answered.
    Response(Response<Body>),
    /// A HandleForward filter stopped the invocation.
    Aborted(Outcome),
}

/// Runs the retry loop of one request against one cluster.
#[derive(Debug)]
pub struct BackendInvoker<'a> {
    pub balancers: &'a BalancerTable,
    pub filters: &'a FilterTable,
    pub transports: &'a TransportCache,
}

impl<'a> BackendInvoker<'a> {
    pub fn new(balancers: &'a BalancerTable, filters: &'a FilterTable, transports: &'a TransportCache) -> Self {
        Self {
            balancers,
            filters,
            transports,
        }
    }

    pub async fn invoke(&self, cluster: &Cluster, req: &mut ProxyRequest) -> Result<Invocation, InvokeError> {
        let result = self.run(cluster, req).await;

        if req.retry_time > 0 {
            metrics::counter!("proxy_requests_with_retry_total", "cluster" => cluster.name.clone())
                .increment(1);
        }
        if req.cross_cluster_retry {
            metrics::counter!("proxy_cross_cluster_requests_total", "cluster" => cluster.name.clone())
                .increment(1);
        }
        result
    }

    async fn run(&self, cluster: &Cluster, req: &mut ProxyRequest) -> Result<Invocation, InvokeError> {
        let Some(balancer) = self.balancers.get(&cluster.name) else {
            let err = InvokeError::NoBalancer(cluster.name.clone());
            req.set_error(ErrorCode::NoBalancer, err.to_string());
            return Err(err);
        };
        if req.out_request.is_none() {
            req.set_error(ErrorCode::BackendOther, InvokeError::NotPrepared.to_string());
            return Err(InvokeError::NotPrepared);
        }

        let mut attempts = 0u32;
        let mut last_error: Option<TransportError> = None;

        for iteration in 0..MAX_ATTEMPTS {
            let backend = match balancer.balance(req) {
                Ok(backend) => backend,
                Err(BalanceError::CrossClusterRetry) => {
                    req.retry_time += 1;
                    req.cross_cluster_retry = true;
                    metrics::counter!("proxy_cross_cluster_retries_total", "cluster" => cluster.name.clone())
                        .increment(1);
                    tracing::info!(
                        request_id = %req.id,
                        cluster = %cluster.name,
                        retry_time = req.retry_time,
                        "Primary backends exhausted, switching to failover"
                    );
                    continue;
                }
                Err(err) => {
                    req.set_error(ErrorCode::NoBackend, err.to_string());
                    return Err(err.into());
                }
            };

            let outcome = self.filters.run(FilterStage::HandleForward, req, None);
            if !outcome.is_go_on() {
                req.set_error(ErrorCode::ForwardAborted, format!("handle_forward returned {}", outcome.kind()));
                return Ok(Invocation::Aborted(outcome));
            }

            let transport = self.transports.get_or_create(cluster);
            req.bind_backend(&backend, transport.clone());
            let now = Instant::now();
            req.stat.backend_first.get_or_insert(now);
            req.stat.backend_start = Some(now);
            attempts += 1;

            // the outbound message was checked above and is never taken
            let Some(out) = req.out_request.as_ref() else {
                return Err(InvokeError::NotPrepared);
            };
            let result = transport.round_trip(out).await;
            req.stat.backend_end = Some(Instant::now());

            match result {
                Ok(mut resp) => {
                    if cluster.outlier.is_failure(resp.status()) {
                        backend.on_fail();
                    } else {
                        backend.on_success();
                    }
                    strip_hop_headers(resp.headers_mut());
                    req.clear_error();
                    tracing::debug!(
                        request_id = %req.id,
                        cluster = %cluster.name,
                        backend = %backend.addr,
                        status = resp.status().as_u16(),
                        retry_time = req.retry_time,
                        "Backend responded"
                    );
                    return Ok(Invocation::Response(resp));
                }
                Err(err) => {
                    metrics::counter!(
                        "proxy_backend_errors_total",
                        "cluster" => cluster.name.clone(),
                        "kind" => err.kind.as_str()
                    )
                    .increment(1);
                    req.set_error(err.kind.error_code(), err.to_string());
                    if err.kind == TransportErrorKind::Connect {
                        backend.on_fail();
                    }

                    let bodyless_get = req.out_request.as_ref().is_some_and(|o| o.is_bodyless_get());
                    let eligible = is_retry_eligible(err.kind, cluster.retry_level, bodyless_get);
                    tracing::warn!(
                        request_id = %req.id,
                        cluster = %cluster.name,
                        backend = %backend.addr,
                        kind = %err.kind,
                        error = %err.message,
                        retry_time = req.retry_time,
                        retry = eligible,
                        "Backend attempt failed"
                    );
                    if !eligible {
                        return Err(InvokeError::Transport { attempts, source: err });
                    }
                    if iteration + 1 < MAX_ATTEMPTS {
                        req.retry_time += 1;
                        metrics::counter!("proxy_retries_total", "cluster" => cluster.name.clone())
                            .increment(1);
                    }
                    last_error = Some(err);
                }
            }
        }

        tracing::error!(
            request_id = %req.id,
            cluster = %cluster.name,
            retry_time = req.retry_time,
            "Retry limit reached"
        );
        match last_error {
            Some(source) => Err(InvokeError::Transport { attempts, source }),
            None => {
                req.set_error(ErrorCode::NoBackend, InvokeError::Exhausted(MAX_ATTEMPTS).to_string());
                Err(InvokeError::Exhausted(MAX_ATTEMPTS))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::http::StatusCode;

    use crate::config::schema::ClusterConfig;
    use crate::health::state::HealthThresholds;
    use crate::http::request::tests::{request, request_with_body};
    use crate::http::request::OutRequest;
    use crate::load_balancer::round_robin::RoundRobin;
    use crate::load_balancer::{Backend, Balancer, ClusterBalancer};
    use crate::resilience::retries::RetryLevel;
    use crate::transport::Transport;

    /// Per-backend scripted answers: a status or a failure kind.
    #[derive(Debug, Default)]
    struct Scripted {
        answers: Mutex<HashMap<SocketAddr, Result<u16, TransportErrorKind>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn answer(&self, addr: SocketAddr, answer: Result<u16, TransportErrorKind>) {
            self.answers.lock().unwrap().insert(addr, answer);
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn round_trip(&self, req: &OutRequest) -> Result<Response<Body>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let addr = req.backend.expect("backend bound");
            match self.answers.lock().unwrap().get(&addr).copied() {
                Some(Ok(status)) => {
                    let mut resp = Response::new(Body::from("ok"));
                    *resp.status_mut() = StatusCode::from_u16(status).unwrap();
                    Ok(resp)
                }
                Some(Err(kind)) => Err(TransportError::new(kind, "scripted")),
                None => Err(TransportError::new(TransportErrorKind::Other, "no script")),
            }
        }
    }

    fn backend(port: u16) -> Arc<Backend> {
        let thresholds = HealthThresholds {
            failure: 100,
            ..Default::default()
        };
        Arc::new(Backend::new(
            format!("b{port}"),
            SocketAddr::from(([127, 0, 0, 1], port)),
            1,
            thresholds,
        ))
    }

    struct Fixture {
        cluster: Cluster,
        balancers: BalancerTable,
        filters: FilterTable,
        transports: TransportCache,
        script: Arc<Scripted>,
    }

    impl Fixture {
        fn new(primary: Vec<Arc<Backend>>, failover: Vec<Arc<Backend>>, retry_level: RetryLevel) -> Self {
            let cluster = Cluster::from_config(
                &ClusterConfig {
                    name: "web".into(),
                    retry_level,
                    ..Default::default()
                },
                &Default::default(),
            )
            .unwrap();
            let mut balancers = BalancerTable::new();
            balancers.insert(
                "web",
                Arc::new(ClusterBalancer::new("web", primary, failover, Box::new(RoundRobin::new()))),
            );
            let script = Arc::new(Scripted::default());
            let shared = script.clone();
            let transports = TransportCache::with_factory(Arc::new(move |_| shared.clone() as Arc<dyn Transport>));
            Self {
                cluster,
                balancers,
                filters: FilterTable::new(),
                transports,
                script,
            }
        }

        async fn invoke(&self, req: &mut ProxyRequest) -> Result<Invocation, InvokeError> {
            req.build_out_request();
            BackendInvoker::new(&self.balancers, &self.filters, &self.transports)
                .invoke(&self.cluster, req)
                .await
        }
    }

    fn status(result: Result<Invocation, InvokeError>) -> StatusCode {
        match result {
            Ok(Invocation::Response(resp)) => resp.status(),
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_attempt_success() {
        let b = backend(9001);
        let fx = Fixture::new(vec![b.clone()], vec![], RetryLevel::IdempotentGet);
        fx.script.answer(b.addr, Ok(200));

        let mut req = request("GET", "/", &[]);
        assert_eq!(status(fx.invoke(&mut req).await), StatusCode::OK);
        assert_eq!(req.retry_time, 0);
        assert_eq!(b.success_total(), 1);
        assert!(req.stat.backend_first.is_some());
        assert!(req.stat.last_attempt().is_some());
        assert!(req.error.is_none());
    }

    #[tokio::test]
    async fn connect_error_moves_to_next_backend() {
        let bad = backend(9001);
        let good = backend(9002);
        let fx = Fixture::new(vec![bad.clone(), good.clone()], vec![], RetryLevel::IdempotentGet);
        fx.script.answer(bad.addr, Err(TransportErrorKind::Connect));
        fx.script.answer(good.addr, Ok(200));

        let mut req = request("GET", "/", &[]);
        assert_eq!(status(fx.invoke(&mut req).await), StatusCode::OK);
        assert_eq!(req.retry_time, 1);
        assert_eq!(bad.failure_total(), 1);
        assert_eq!(good.success_total(), 1);
        // cleared by the successful attempt
        assert!(req.error.is_none());
        assert_eq!(req.backend().unwrap().addr, good.addr);
    }

    #[tokio::test]
    async fn post_write_error_is_not_retried() {
        let a = backend(9001);
        let b = backend(9002);
        let fx = Fixture::new(vec![a.clone(), b.clone()], vec![], RetryLevel::IdempotentGet);
        fx.script.answer(a.addr, Err(TransportErrorKind::WriteRequest));
        fx.script.answer(b.addr, Ok(200));

        let mut req = request_with_body("POST", "/submit", &[], Body::from("payload"));
        req.buffer_body(1024).await.unwrap();
        let err = fx.invoke(&mut req).await.unwrap_err();
        assert!(matches!(err, InvokeError::Transport { attempts: 1, .. }));
        assert_eq!(req.retry_time, 0);
        assert_eq!(req.error_code(), Some(ErrorCode::WriteBackend));
        assert_eq!(fx.script.calls.load(Ordering::SeqCst), 1);
        // not a connect failure: health untouched
        assert_eq!(a.failure_total(), 0);
    }

    #[tokio::test]
    async fn bodyless_get_write_error_is_retried() {
        let a = backend(9001);
        let b = backend(9002);
        let fx = Fixture::new(vec![a.clone(), b.clone()], vec![], RetryLevel::IdempotentGet);
        fx.script.answer(a.addr, Err(TransportErrorKind::WriteRequest));
        fx.script.answer(b.addr, Ok(204));

        let mut req = request("GET", "/", &[]);
        assert_eq!(status(fx.invoke(&mut req).await), StatusCode::NO_CONTENT);
        assert_eq!(req.retry_time, 1);
    }

    #[tokio::test]
    async fn retry_level_none_only_retries_connect() {
        let a = backend(9001);
        let b = backend(9002);
        let fx = Fixture::new(vec![a.clone(), b.clone()], vec![], RetryLevel::None);
        fx.script.answer(a.addr, Err(TransportErrorKind::ResponseHeaderTimeout));
        fx.script.answer(b.addr, Ok(200));

        let mut req = request("GET", "/", &[]);
        let err = fx.invoke(&mut req).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::BackendHeaderTimeout);
    }

    #[tokio::test]
    async fn header_timeout_and_broken_transport_leave_health_alone() {
        let a = backend(9001);
        let b = backend(9002);
        let fx = Fixture::new(vec![a.clone(), b.clone()], vec![], RetryLevel::None);
        fx.script.answer(a.addr, Err(TransportErrorKind::ResponseHeaderTimeout));
        fx.script.answer(b.addr, Err(TransportErrorKind::Broken));

        for _ in 0..2 {
            let mut req = request("GET", "/", &[]);
            assert!(fx.invoke(&mut req).await.is_err());
        }
        assert_eq!(a.failure_total() + b.failure_total(), 0);
        assert!(a.is_available() && b.is_available());
    }

    #[tokio::test]
    async fn connect_errors_stop_at_the_cap() {
        let a = backend(9001);
        let b = backend(9002);
        let fx = Fixture::new(vec![a.clone(), b.clone()], vec![], RetryLevel::IdempotentGet);
        fx.script.answer(a.addr, Err(TransportErrorKind::Connect));
        fx.script.answer(b.addr, Err(TransportErrorKind::Connect));

        let mut req = request("GET", "/", &[]);
        let err = fx.invoke(&mut req).await.unwrap_err();
        assert!(matches!(err, InvokeError::Transport { attempts: 20, .. }));
        assert_eq!(fx.script.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
        assert_eq!(a.failure_total() + b.failure_total(), MAX_ATTEMPTS as u64);
        assert_eq!(req.error_code(), Some(ErrorCode::ConnectBackend));
    }

    #[tokio::test]
    async fn cross_cluster_retry_uses_failover_pool() {
        let down = backend(9001);
        let spare = backend(9101);
        // eject the only primary backend
        let thresholds = HealthThresholds {
            failure: 1,
            ..Default::default()
        };
        let ejected = Arc::new(Backend::new("down", down.addr, 1, thresholds));
        ejected.on_fail();

        let fx = Fixture::new(vec![ejected], vec![spare.clone()], RetryLevel::IdempotentGet);
        fx.script.answer(spare.addr, Ok(200));

        let mut req = request("GET", "/", &[]);
        assert_eq!(status(fx.invoke(&mut req).await), StatusCode::OK);
        assert!(req.cross_cluster_retry);
        assert_eq!(req.retry_time, 1);
        assert_eq!(fx.script.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outlier_status_counts_as_failure() {
        let b = backend(9001);
        let fx = Fixture::new(vec![b.clone()], vec![], RetryLevel::IdempotentGet);
        fx.script.answer(b.addr, Ok(503));

        let mut req = request("GET", "/", &[]);
        assert_eq!(status(fx.invoke(&mut req).await), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(b.failure_total(), 1);
        assert_eq!(req.retry_time, 0);
    }

    #[tokio::test]
    async fn handle_forward_can_abort() {
        let b = backend(9001);
        let mut fx = Fixture::new(vec![b.clone()], vec![], RetryLevel::IdempotentGet);
        fx.filters
            .register_fn(FilterStage::HandleForward, "deny", |_, _| Outcome::Finish);

        let mut req = request("GET", "/", &[]);
        let result = fx.invoke(&mut req).await;
        assert!(matches!(result, Ok(Invocation::Aborted(Outcome::Finish))));
        assert_eq!(fx.script.calls.load(Ordering::SeqCst), 0);
        assert_eq!(req.error_code(), Some(ErrorCode::ForwardAborted));
    }

    #[tokio::test]
    async fn missing_balancer_fails_closed() {
        let fx = Fixture::new(vec![backend(9001)], vec![], RetryLevel::IdempotentGet);
        let mut other = fx.cluster.clone();
        other.name = "unknown".into();

        let mut req = request("GET", "/", &[]);
        req.build_out_request();
        let err = BackendInvoker::new(&fx.balancers, &fx.filters, &fx.transports)
            .invoke(&other, &mut req)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::NoBalancer);
    }

    #[tokio::test]
    async fn empty_cluster_reports_no_backend() {
        let fx = Fixture::new(vec![], vec![], RetryLevel::IdempotentGet);
        let mut req = request("GET", "/", &[]);
        let err = fx.invoke(&mut req).await.unwrap_err();
        assert!(matches!(err, InvokeError::Balance(BalanceError::NoBackend(_))));
        assert_eq!(req.error_code(), Some(ErrorCode::NoBackend));
    }

    #[test]
    fn balancer_backends_are_listed() {
        let fx = Fixture::new(vec![backend(9001)], vec![backend(9101)], RetryLevel::None);
        assert_eq!(fx.balancers.get("web").unwrap().backends().len(), 2);
    }
}
