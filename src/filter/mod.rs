//! Filter subsystem.
//!
//! # Data Flow
//! ```text
//! Startup / reload:
//!     modules::build_filter_table(config) → FilterTable → ArcSwap
//!
//! Per request (proxy::pipeline):
//!     FilterTable::run(stage, req, resp?)
//!         → filters of the stage, in registration order
//!         → first non-GoOn Outcome stops the stage
//!     → pipeline dispatches on the Outcome
//!
//! Filter to filter:
//!     writer → req.context.insert(KEY, v)
//!     reader → req.context.get(KEY)
//! ```
//!
//! # Design Decisions
//! - Outcome is a closed enum; the pipeline is the only interpreter
//! - Context keys are typed constants so producers and consumers agree on
//!   the value type at compile time
//! - No per-filter deadline: filters are synchronous and must not block

pub mod chain;
pub mod context;
pub mod outcome;
pub mod stage;

pub use chain::{Filter, FilterTable};
pub use context::{keys, Context, ContextKey};
pub use outcome::Outcome;
pub use stage::FilterStage;
