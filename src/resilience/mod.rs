//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (connect / response-header / client deadlines)
//!     → On failure: retries.rs (classify, decide whether to try again)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Retries only where the backend cannot have acted on the request
//! - Total work per request is capped regardless of policy

pub mod retries;
pub mod timeouts;
