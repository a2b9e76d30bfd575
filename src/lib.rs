//! Edge reverse proxy: request pipeline and failover engine.

pub mod admin;
pub mod config;
pub mod filter;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod modules;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod resilience;
pub mod routing;
pub mod transport;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::ProxyEngine;
