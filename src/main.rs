//! Edge Reverse Proxy
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────────────┐
//!                       │                       EDGE PROXY                         │
//!   Client Request      │  ┌─────────┐   ┌─────────┐   ┌──────────────────────┐    │
//!   ────────────────────┼─▶│   net   │──▶│  http   │──▶│   proxy::pipeline    │    │
//!                       │  │listener │   │ server  │   │ filters → routing →  │    │
//!                       │  └─────────┘   └─────────┘   │ body → invoker       │    │
//!                       │                              └──────────┬───────────┘    │
//!                       │                                         ▼                │
//!                       │                              ┌──────────────────────┐    │
//!                       │                              │ load_balancer + pool │    │
//!                       │                              │ transport cache      │────┼──▶ Backend
//!                       │                              └──────────┬───────────┘    │
//!   Client Response     │  ┌──────────────┐   ┌──────────────┐    │                │
//!   ◀───────────────────┼──│ disposition  │◀──│   streamer   │◀───┘                │
//!                       │  └──────────────┘   └──────────────┘                     │
//!                       │                                                          │
//!                       │  config · health · observability · lifecycle · admin     │
//!                       └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use edge_proxy::lifecycle::startup;

#[derive(Debug, Parser)]
#[command(name = "edge-proxy", version, about = "Edge reverse proxy")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match startup::run(&args.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // logging may not be initialized yet
            eprintln!("edge-proxy: {e}");
            tracing::error!(error = %e, "Fatal startup error");
            ExitCode::FAILURE
        }
    }
}
