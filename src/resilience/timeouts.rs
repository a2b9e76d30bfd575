//! Timeout values.
//!
//! # Responsibilities
//! - Convert configured millisecond values into durations
//! - Carry the five deadlines armed along the request pipeline
//!
//! # Design Decisions
//! - A cluster's `[timeouts]` overrides are merged over the server values,
//!   so unset fields inherit them
//! - Zero means "no limit" only for the idle (read-again) timeout; the
//!   validator rejects zero for every other timeout

use std::time::Duration;

use crate::config::TimeoutConfig;

/// Resolved timeouts for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub response_header: Duration,
    pub read_client: Duration,
    pub write_client: Duration,
    pub read_client_again: Duration,
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_ms),
            response_header: Duration::from_millis(config.response_header_ms),
            read_client: Duration::from_millis(config.read_client_ms),
            write_client: Duration::from_millis(config.write_client_ms),
            read_client_again: Duration::from_millis(config.read_client_again_ms),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl Timeouts {
    /// Idle timeout for kept-alive connections, `None` when disabled.
    pub fn idle(&self) -> Option<Duration> {
        (!self.read_client_again.is_zero()).then_some(self.read_client_again)
    }
}
