//! Request-level error taxonomy.

use std::fmt;

use axum::http::StatusCode;

use crate::load_balancer::BalanceError;
use crate::transport::TransportError;

/// Classified failure recorded on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoProduct,
    NoCluster,
    NoBalancer,
    NoBackend,
    ConnectBackend,
    WriteBackend,
    ReadBackendHeader,
    BackendHeaderTimeout,
    TransportBroken,
    BackendOther,
    ReadClientBody,
    WriteClient,
    ForwardAborted,
    FilterFinished,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NoProduct => "ERR_NO_PRODUCT",
            ErrorCode::NoCluster => "ERR_NO_CLUSTER",
            ErrorCode::NoBalancer => "ERR_NO_BALANCER",
            ErrorCode::NoBackend => "ERR_NO_BACKEND",
            ErrorCode::ConnectBackend => "ERR_CONNECT_BACKEND",
            ErrorCode::WriteBackend => "ERR_WRITE_BACKEND",
            ErrorCode::ReadBackendHeader => "ERR_READ_BACKEND_HEADER",
            ErrorCode::BackendHeaderTimeout => "ERR_BACKEND_HEADER_TIMEOUT",
            ErrorCode::TransportBroken => "ERR_TRANSPORT_BROKEN",
            ErrorCode::BackendOther => "ERR_BACKEND_OTHER",
            ErrorCode::ReadClientBody => "ERR_READ_CLIENT_BODY",
            ErrorCode::WriteClient => "ERR_WRITE_CLIENT",
            ErrorCode::ForwardAborted => "ERR_FORWARD_ABORTED",
            ErrorCode::FilterFinished => "ERR_FILTER_FINISHED",
        }
    }

    /// Status of the response synthesized when this error ends a request.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::ReadClientBody => StatusCode::BAD_REQUEST,
            ErrorCode::FilterFinished => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error slot of a request: what went wrong last, kept for logging even
/// when a later attempt succeeded and cleared it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub code: ErrorCode,
    pub msg: String,
}

/// Why the backend invocation produced no response.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("no balancer for cluster `{0}`")]
    NoBalancer(String),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error("giving up after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("retry limit of {0} iterations reached")]
    Exhausted(usize),
    #[error("request has no outbound message")]
    NotPrepared,
}

impl InvokeError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            InvokeError::NoBalancer(_) => ErrorCode::NoBalancer,
            InvokeError::Balance(_) | InvokeError::Exhausted(_) => ErrorCode::NoBackend,
            InvokeError::Transport { source, .. } => source.kind.error_code(),
            InvokeError::NotPrepared => ErrorCode::BackendOther,
        }
    }
}

/// Failures that end a request without any response being written; the
/// server closes the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("connection closed by filter")]
    Closed,
    #[error("request handler panicked")]
    Panicked,
}
