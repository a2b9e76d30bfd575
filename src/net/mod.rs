//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (id, tracking for graceful shutdown)
//!     → deadline.rs (DeadlineIo for HTTP/1, per-stream deadlines for h2)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is terminated in front of the proxy; the negotiated protocol
//!   only selects the deadline strategy

pub mod connection;
pub mod deadline;
pub mod listener;
