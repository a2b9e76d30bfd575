//! The per-request pipeline.
//!
//! # Data Flow
//! ```text
//! BeforeLocation filters
//!     → find_product → FoundProduct filters
//!     → find_cluster + lookup → AfterLocation filters
//!     → read client body (read deadline armed)
//!     → BackendInvoker (HandleForward filters inside the retry loop)
//!     → ReadResponse filters
//!     → response handed to the engine for streaming
//! ```
//!
//! # Design Decisions
//! - Each phase either advances to the next one or exits; every exit
//!   converges on `Exit::into_processed`, the only place a response is
//!   synthesized
//! - Routing, balancing and transport failures answer with an internal
//!   error and close the connection after the reply
//! - A `Response` or `Redirect` outcome skips every remaining phase,
//!   the backend included

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use tokio::time::Instant;

use crate::filter::{keys, FilterStage, Outcome};
use crate::http::request::{BodyError, ProxyRequest};
use crate::http::response::{error_response, finish_response, redirect};
use crate::proxy::disposition::Action;
use crate::proxy::error::ErrorCode;
use crate::proxy::invoker::{BackendInvoker, Invocation};
use crate::proxy::RuntimeTables;
use crate::routing::Cluster;
use crate::transport::TransportCache;

/// Result of running the pipeline for one request.
#[derive(Debug)]
pub struct Processed {
    /// `None` when the connection must be dropped without a reply.
    pub response: Option<Response<Body>>,
    /// The pipeline's vote on the connection.
    pub action: Action,
    pub cluster: Option<Arc<Cluster>>,
}

enum Phase {
    BeforeLocation,
    FindProduct,
    FoundProduct,
    FindCluster,
    AfterLocation,
    ReadBody,
    Forward,
    ReadResponse(Response<Body>),
}

enum Step {
    Advance(Phase),
    Exit(Exit),
}

enum Exit {
    Respond(Response<Body>),
    /// A filter stopped the pipeline. `floor` is the weakest action the
    /// connection gets regardless of the outcome.
    Filtered { outcome: Outcome, floor: Action },
    /// A fatal error already recorded on the request.
    Failed(StatusCode),
}

/// Drives one request through the phases.
pub struct Pipeline<'a> {
    tables: &'a RuntimeTables,
    transports: &'a TransportCache,
}

impl<'a> Pipeline<'a> {
    pub fn new(tables: &'a RuntimeTables, transports: &'a TransportCache) -> Self {
        Self { tables, transports }
    }

    pub async fn process(&self, req: &mut ProxyRequest) -> Processed {
        let mut cluster = None;
        let mut phase = Phase::BeforeLocation;
        let exit = loop {
            match self.step(phase, req, &mut cluster).await {
                Step::Advance(next) => phase = next,
                Step::Exit(exit) => break exit,
            }
        };
        let (response, action) = exit.into_processed(req);
        Processed {
            response,
            action,
            cluster,
        }
    }

    fn filter(&self, stage: FilterStage, req: &mut ProxyRequest, next: Phase) -> Step {
        match self.tables.filters.run(stage, req, None) {
            Outcome::GoOn => Step::Advance(next),
            outcome => Step::Exit(Exit::Filtered {
                outcome,
                floor: Action::KeepAlive,
            }),
        }
    }

    async fn step(&self, phase: Phase, req: &mut ProxyRequest, cluster: &mut Option<Arc<Cluster>>) -> Step {
        let resolver = &self.tables.resolver;
        match phase {
            Phase::BeforeLocation => self.filter(FilterStage::BeforeLocation, req, Phase::FindProduct),

            Phase::FindProduct => match resolver.find_product(req) {
                Ok(()) => Step::Advance(Phase::FoundProduct),
                Err(err) => {
                    tracing::warn!(request_id = %req.id, error = %err, "Product lookup failed");
                    req.set_error(err.error_code(), err.to_string());
                    Step::Exit(Exit::Failed(StatusCode::INTERNAL_SERVER_ERROR))
                }
            },

            Phase::FoundProduct => self.filter(FilterStage::FoundProduct, req, Phase::FindCluster),

            Phase::FindCluster => {
                let found = resolver.find_cluster(req).and_then(|()| {
                    let name = req.route.cluster_name.as_deref().unwrap_or_default();
                    resolver.lookup(name)
                });
                match found {
                    Ok(found) => {
                        *cluster = Some(found);
                        Step::Advance(Phase::AfterLocation)
                    }
                    Err(err) => {
                        tracing::warn!(
                            request_id = %req.id,
                            product = req.route.product.as_deref().unwrap_or("-"),
                            error = %err,
                            "Cluster lookup failed"
                        );
                        req.set_error(err.error_code(), err.to_string());
                        Step::Exit(Exit::Failed(StatusCode::INTERNAL_SERVER_ERROR))
                    }
                }
            }

            Phase::AfterLocation => self.filter(FilterStage::AfterLocation, req, Phase::ReadBody),

            Phase::ReadBody => {
                let read_timeout = cluster
                    .as_ref()
                    .map_or(self.tables.timeouts.read_client, |c| c.timeouts.read_client);
                let deadline = req.conn.deadline.clone();
                deadline.set_read_deadline(Some(Instant::now() + read_timeout));
                let read = req.buffer_body(self.tables.max_body_bytes).await;
                deadline.set_read_deadline(None);

                match read {
                    Ok(()) => Step::Advance(Phase::Forward),
                    Err(err) => {
                        let status = match err {
                            BodyError::Timeout => StatusCode::REQUEST_TIMEOUT,
                            BodyError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                            BodyError::Read(_) => StatusCode::BAD_REQUEST,
                        };
                        tracing::info!(request_id = %req.id, error = %err, "Client body rejected");
                        req.set_error(ErrorCode::ReadClientBody, err.to_string());
                        Step::Exit(Exit::Failed(status))
                    }
                }
            }

            Phase::Forward => {
                let Some(target) = cluster.clone() else {
                    req.set_error(ErrorCode::NoCluster, "no cluster resolved");
                    return Step::Exit(Exit::Failed(StatusCode::INTERNAL_SERVER_ERROR));
                };
                req.build_out_request();
                let invoker = BackendInvoker::new(&self.tables.balancers, &self.tables.filters, self.transports);
                match invoker.invoke(&target, req).await {
                    Ok(Invocation::Response(resp)) => Step::Advance(Phase::ReadResponse(resp)),
                    Ok(Invocation::Aborted(outcome)) => Step::Exit(Exit::Filtered {
                        outcome,
                        floor: Action::CloseAfterReply,
                    }),
                    Err(err) => {
                        tracing::error!(
                            request_id = %req.id,
                            cluster = %target.name,
                            retry_time = req.retry_time,
                            error = %err,
                            "Backend invocation failed"
                        );
                        if req.error.is_none() {
                            req.set_error(err.error_code(), err.to_string());
                        }
                        Step::Exit(Exit::Failed(StatusCode::INTERNAL_SERVER_ERROR))
                    }
                }
            }

            Phase::ReadResponse(mut resp) => {
                match self.tables.filters.run(FilterStage::ReadResponse, req, Some(&mut resp)) {
                    Outcome::GoOn => Step::Exit(Exit::Respond(resp)),
                    // dropping the backend response releases its connection
                    outcome => Step::Exit(Exit::Filtered {
                        outcome,
                        floor: Action::KeepAlive,
                    }),
                }
            }
        }
    }
}

impl Exit {
    fn into_processed(self, req: &mut ProxyRequest) -> (Option<Response<Body>>, Action) {
        match self {
            Exit::Respond(resp) => (Some(resp), Action::KeepAlive),
            Exit::Failed(status) => (Some(error_response(status)), Action::CloseAfterReply),
            Exit::Filtered { outcome, floor } => {
                let action = Action::from_outcome(&outcome).combine(floor);
                let response = match outcome {
                    Outcome::Close => None,
                    Outcome::Finish => {
                        if req.error.is_none() && !req.context.contains(&keys::FINISH_STATUS) {
                            req.set_error(ErrorCode::FilterFinished, "finished by filter");
                        }
                        Some(finish_response(req))
                    }
                    Outcome::Response(resp) => Some(resp),
                    Outcome::Redirect {
                        location,
                        status,
                        headers,
                    } => Some(redirect(&location, status, headers, &req.head.method)),
                    // stages only stop on a non-GoOn outcome
                    Outcome::GoOn => Some(error_response(StatusCode::INTERNAL_SERVER_ERROR)),
                };
                (response, action)
            }
        }
    }
}
