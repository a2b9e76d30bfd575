//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (request_id, conn_id, cluster, backend fields)
//!     → metrics macros (counters, gauges, histograms)
//!
//! Consumers:
//!     → logging.rs: stdout, human readable or JSON
//!     → metrics.rs: Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - Request ID flows through every log line of a request
//! - One access line per request, emitted after the connection decision

pub mod logging;
pub mod metrics;
