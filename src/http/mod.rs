//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper auto builder: HTTP/1.1 or prior-knowledge h2c,
//!                  connection deadlines, graceful close)
//!     → request.rs (ProxyRequest: request ID, body buffering, outbound copy)
//!     → proxy engine
//!     → response.rs (hop-by-hop stripping, synthesized responses)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{ProxyRequest, X_REQUEST_ID};
pub use server::{HttpServer, ServerError};
