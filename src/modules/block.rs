//! Request blocking.
//!
//! Requests from a denied client address, or for a denied path prefix,
//! get their connection closed without a reply.

use std::collections::HashSet;
use std::net::IpAddr;

use axum::body::Body;
use axum::http::Response;

use crate::config::schema::BlockConfig;
use crate::filter::{Filter, Outcome};
use crate::http::request::ProxyRequest;

#[derive(Debug, Default)]
pub struct BlockFilter {
    client_ips: HashSet<IpAddr>,
    path_prefixes: Vec<String>,
}

impl BlockFilter {
    pub fn from_config(config: &BlockConfig) -> Self {
        let client_ips = config
            .client_ips
            .iter()
            .filter_map(|ip| match ip.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!(%ip, "Ignoring invalid blocked client ip");
                    None
                }
            })
            .collect();
        Self {
            client_ips,
            path_prefixes: config.path_prefixes.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.client_ips.is_empty() && self.path_prefixes.is_empty()
    }
}

impl Filter for BlockFilter {
    fn handle(&self, req: &mut ProxyRequest, _resp: Option<&mut Response<Body>>) -> Outcome {
        let client = req.conn.peer.ip();
        let path = req.head.uri.path();
        let blocked = self.client_ips.contains(&client)
            || self.path_prefixes.iter().any(|p| path.starts_with(p.as_str()));
        if !blocked {
            return Outcome::GoOn;
        }
        tracing::info!(request_id = %req.id, %client, path, "Request blocked");
        metrics::counter!("proxy_blocked_requests_total").increment(1);
        Outcome::Close
    }
}
