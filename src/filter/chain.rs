//! Filter registration and stage execution.
//!
//! # Responsibilities
//! - Hold the ordered filter list of every stage
//! - Run a stage, stopping at the first filter that does not return GoOn
//!
//! # Design Decisions
//! - A table is built once (startup or reload) and never mutated while
//!   requests run; reload publishes a new table
//! - Filters are synchronous and get exclusive access to the request for
//!   the duration of the call

use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Response;

use crate::filter::outcome::Outcome;
use crate::filter::stage::FilterStage;
use crate::http::request::ProxyRequest;

/// A request/response interceptor.
pub trait Filter: Send + Sync {
    /// Inspect or mutate the request (and, from ReadResponse on, the
    /// response) and tell the pipeline how to proceed.
    fn handle(&self, req: &mut ProxyRequest, resp: Option<&mut Response<Body>>) -> Outcome;
}

struct FnFilter<F>(F);

impl<F> Filter for FnFilter<F>
where
    F: Fn(&mut ProxyRequest, Option<&mut Response<Body>>) -> Outcome + Send + Sync,
{
    fn handle(&self, req: &mut ProxyRequest, resp: Option<&mut Response<Body>>) -> Outcome {
        (self.0)(req, resp)
    }
}

struct Registered {
    name: String,
    filter: Arc<dyn Filter>,
}

/// Filters of every stage, in registration order.
#[derive(Default)]
pub struct FilterTable {
    stages: [Vec<Registered>; FilterStage::ALL.len()],
}

impl fmt::Debug for FilterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for stage in FilterStage::ALL {
            let names: Vec<&str> = self.stages[stage.index()]
                .iter()
                .map(|r| r.name.as_str())
                .collect();
            map.entry(&stage.as_str(), &names);
        }
        map.finish()
    }
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: FilterStage, name: impl Into<String>, filter: Arc<dyn Filter>) {
        self.stages[stage.index()].push(Registered {
            name: name.into(),
            filter,
        });
    }

    /// Register a closure as a filter.
    pub fn register_fn<F>(&mut self, stage: FilterStage, name: impl Into<String>, f: F)
    where
        F: Fn(&mut ProxyRequest, Option<&mut Response<Body>>) -> Outcome + Send + Sync + 'static,
    {
        self.register(stage, name, Arc::new(FnFilter(f)));
    }

    /// Names of the filters registered at `stage`.
    pub fn names(&self, stage: FilterStage) -> impl Iterator<Item = &str> {
        self.stages[stage.index()].iter().map(|r| r.name.as_str())
    }

    /// Run every filter of `stage` until one returns something other than
    /// `GoOn`, and return that outcome.
    pub fn run(
        &self,
        stage: FilterStage,
        req: &mut ProxyRequest,
        mut resp: Option<&mut Response<Body>>,
    ) -> Outcome {
        for entry in &self.stages[stage.index()] {
            let outcome = entry.filter.handle(req, resp.as_deref_mut());
            if !outcome.is_go_on() {
                tracing::debug!(
                    request_id = %req.id,
                    stage = %stage,
                    filter = %entry.name,
                    outcome = outcome.kind(),
                    "Filter stopped stage"
                );
                metrics::counter!(
                    "proxy_filter_aborts_total",
                    "stage" => stage.as_str(),
                    "outcome" => outcome.kind()
                )
                .increment(1);
                return outcome;
            }
        }
        Outcome::GoOn
    }
}
