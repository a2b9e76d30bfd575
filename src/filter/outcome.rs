//! Filter outcomes.

use std::fmt;

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode};

/// Control signal a filter hands back to the pipeline.
pub enum Outcome {
    /// Continue with the next filter or phase.
    GoOn,
    /// Abort: send nothing and close the connection.
    Close,
    /// Stop processing, reply, then close the connection.
    Finish,
    /// Skip routing and the backend; stream this response instead.
    Response(Response<Body>),
    /// Reply with a redirect and skip the backend.
    Redirect {
        location: String,
        status: StatusCode,
        headers: HeaderMap,
    },
}

impl Outcome {
    pub fn redirect(location: impl Into<String>, status: StatusCode) -> Self {
        Outcome::Redirect {
            location: location.into(),
            status,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_go_on(&self) -> bool {
        matches!(self, Outcome::GoOn)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::GoOn => "go_on",
            Outcome::Close => "close",
            Outcome::Finish => "finish",
            Outcome::Response(_) => "response",
            Outcome::Redirect { .. } => "redirect",
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Response(resp) => f
                .debug_tuple("Response")
                .field(&resp.status())
                .finish(),
            Outcome::Redirect {
                location, status, ..
            } => f
                .debug_struct("Redirect")
                .field("location", location)
                .field("status", status)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}
