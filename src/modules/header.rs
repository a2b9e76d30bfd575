//! Static response headers.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Response};

use crate::filter::{Filter, Outcome};
use crate::http::request::ProxyRequest;

/// Sets configured headers on every backend response.
#[derive(Debug, Default)]
pub struct HeaderFilter {
    headers: HeaderMap,
}

impl HeaderFilter {
    pub fn from_config(headers: &BTreeMap<String, String>) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => tracing::warn!(%name, "Ignoring invalid response header"),
            }
        }
        Self { headers: map }
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl Filter for HeaderFilter {
    fn handle(&self, _req: &mut ProxyRequest, resp: Option<&mut Response<Body>>) -> Outcome {
        if let Some(resp) = resp {
            for (name, value) in &self.headers {
                resp.headers_mut().insert(name.clone(), value.clone());
            }
        }
        Outcome::GoOn
    }
}
