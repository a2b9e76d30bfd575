//! Prefix redirects.

use axum::body::Body;
use axum::http::{Response, StatusCode};

use crate::config::schema::RedirectRuleConfig;
use crate::filter::{Filter, Outcome};
use crate::http::request::ProxyRequest;

#[derive(Debug, Clone)]
struct Rule {
    prefix: String,
    location: String,
    status: StatusCode,
}

/// Redirects requests by path prefix; the first matching rule wins.
#[derive(Debug, Default)]
pub struct RedirectFilter {
    rules: Vec<Rule>,
}

impl RedirectFilter {
    pub fn from_config(rules: &[RedirectRuleConfig]) -> Self {
        let rules = rules
            .iter()
            .map(|r| Rule {
                prefix: r.prefix.clone(),
                location: r.location.clone(),
                status: StatusCode::from_u16(r.status).unwrap_or(StatusCode::FOUND),
            })
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Filter for RedirectFilter {
    fn handle(&self, req: &mut ProxyRequest, _resp: Option<&mut Response<Body>>) -> Outcome {
        let path = req.head.uri.path();
        match self.rules.iter().find(|r| path.starts_with(r.prefix.as_str())) {
            Some(rule) => {
                tracing::debug!(request_id = %req.id, path, location = %rule.location, "Redirecting");
                Outcome::redirect(rule.location.clone(), rule.status)
            }
            None => Outcome::GoOn,
        }
    }
}
