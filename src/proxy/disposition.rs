//! Connection disposition after a request.
//!
//! # Responsibilities
//! - Combine the invoker's vote, the RequestFinish vote and the HTTP
//!   signals seen on the exchange into one decision
//!
//! # Design Decisions
//! - Actions are ordered by severity and combined with `max`, so a single
//!   close vote wins and the strongest close wins among several

use axum::body::Body;
use axum::http::header::CONNECTION;
use axum::http::{HeaderMap, Request, Response, Version};

use crate::filter::Outcome;

/// What happens to the client connection once the request is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Action {
    #[default]
    KeepAlive,
    /// Finish writing the response, then close.
    CloseAfterReply,
    /// Drop the connection without completing the response.
    CloseDirectly,
}

impl Action {
    pub fn combine(self, other: Action) -> Action {
        self.max(other)
    }

    /// Vote of a filter stage.
    pub fn from_outcome(outcome: &Outcome) -> Action {
        match outcome {
            Outcome::GoOn | Outcome::Response(_) | Outcome::Redirect { .. } => Action::KeepAlive,
            Outcome::Finish => Action::CloseAfterReply,
            Outcome::Close => Action::CloseDirectly,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::KeepAlive => "keep_alive",
            Action::CloseAfterReply => "close_after_reply",
            Action::CloseDirectly => "close_directly",
        }
    }
}

/// `Connection` header lists the `close` token.
pub fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

fn wants_keep_alive(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"))
}

/// HTTP-level signals that can force a close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseSignals {
    /// The client asked for `Connection: close`.
    pub request_close: bool,
    /// The final response carries `Connection: close`.
    pub response_close: bool,
    /// HTTP/1.0 (or older) without an explicit keep-alive.
    pub old_protocol: bool,
    /// Graceful shutdown is in progress.
    pub draining: bool,
}

impl ResponseSignals {
    pub fn from_request<B>(req: &Request<B>, draining: bool) -> Self {
        Self::from_parts(req.version(), req.headers(), draining)
    }

    pub fn from_parts(version: Version, headers: &HeaderMap, draining: bool) -> Self {
        Self {
            request_close: wants_close(headers),
            response_close: false,
            old_protocol: version < Version::HTTP_11 && !wants_keep_alive(headers),
            draining,
        }
    }

    /// Pick up `Connection: close` from the response about to be sent.
    pub fn observe_response(&mut self, resp: &Response<Body>) {
        self.response_close |= wants_close(resp.headers());
    }

    pub fn forces_close(&self) -> bool {
        self.request_close || self.response_close || self.old_protocol || self.draining
    }
}

/// Combine every vote into the action applied to the connection.
pub fn resolve(invoke: Action, finish: Action, signals: &ResponseSignals) -> Action {
    let semantic = if signals.forces_close() {
        Action::CloseAfterReply
    } else {
        Action::KeepAlive
    };
    invoke.combine(finish).combine(semantic)
}
