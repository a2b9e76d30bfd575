//! Retry eligibility.
//!
//! # Responsibilities
//! - Decide whether a failed backend attempt may be repeated
//! - Bound the total number of balancer/transport iterations
//!
//! # Design Decisions
//! - Connect errors always retry: nothing reached the backend
//! - Errors after the request may have been seen by the backend retry only
//!   for bodyless GETs, and only when the cluster allows it
//! - No backoff: the next attempt goes to a different backend immediately

use serde::{Deserialize, Serialize};

use crate::transport::TransportErrorKind;

/// Hard cap on invoker iterations, balancer-level retries included.
pub const MAX_ATTEMPTS: usize = 20;

/// Cluster retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryLevel {
    /// Only connect errors are retried.
    None,
    /// Bodyless GET requests are also retried after write/read failures.
    #[default]
    IdempotentGet,
}

/// Whether an attempt that failed with `kind` may be retried.
pub fn is_retry_eligible(kind: TransportErrorKind, level: RetryLevel, bodyless_get: bool) -> bool {
    match kind {
        TransportErrorKind::Connect => true,
        TransportErrorKind::WriteRequest
        | TransportErrorKind::ReadResponseHeader
        | TransportErrorKind::ResponseHeaderTimeout
        | TransportErrorKind::Broken => level == RetryLevel::IdempotentGet && bodyless_get,
        TransportErrorKind::Other => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_always_retry() {
        assert!(is_retry_eligible(TransportErrorKind::Connect, RetryLevel::None, false));
        assert!(is_retry_eligible(TransportErrorKind::Connect, RetryLevel::IdempotentGet, false));
    }

    #[test]
    fn post_failures_are_not_retried() {
        for kind in [
            TransportErrorKind::WriteRequest,
            TransportErrorKind::ReadResponseHeader,
            TransportErrorKind::ResponseHeaderTimeout,
            TransportErrorKind::Broken,
        ] {
            assert!(!is_retry_eligible(kind, RetryLevel::IdempotentGet, false));
            assert!(is_retry_eligible(kind, RetryLevel::IdempotentGet, true));
            assert!(!is_retry_eligible(kind, RetryLevel::None, true));
        }
    }

    #[test]
    fn other_errors_never_retry() {
        assert!(!is_retry_eligible(TransportErrorKind::Other, RetryLevel::IdempotentGet, true));
    }
}
