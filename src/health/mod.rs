//! Backend health subsystem.
//!
//! # Data Flow
//! ```text
//! Backend response observed (passive.rs):
//!     status matched against the cluster's outlier policy
//!     → Backend::on_success / Backend::on_fail
//!
//! Transport failure observed (invoker):
//!     connect error → Backend::on_fail
//!
//! State machine (state.rs):
//!     Healthy ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Health state is per-backend, not per-pool
//! - Unhealthy backends are re-probed with live traffic after a window

pub mod passive;
pub mod state;
