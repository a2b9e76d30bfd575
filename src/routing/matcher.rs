//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive)
//! - Match path prefix (case-sensitive)
//! - Match an exact header value
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Matchers see only the request head; the body is never inspected
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use axum::http::header::HOST;
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue};

use crate::config::RouteConfig;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, head: &Parts) -> bool;
}

/// Lowercased request host without port, from `Host` or the URI authority.
pub fn request_host(head: &Parts) -> Option<String> {
    let raw = head
        .headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| head.uri.authority().map(|a| a.as_str()))?;
    Some(strip_port(raw).to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, head: &Parts) -> bool {
        request_host(head).is_some_and(|h| h == self.expected_host)
    }
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, head: &Parts) -> bool {
        head.uri.path().starts_with(&self.prefix)
    }
}

/// Matches a header carrying an exact value.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    name: HeaderName,
    value: HeaderValue,
}

impl HeaderMatcher {
    pub fn new(name: HeaderName, value: HeaderValue) -> Self {
        Self { name, value }
    }
}

impl Matcher for HeaderMatcher {
    fn matches(&self, head: &Parts) -> bool {
        head.headers
            .get_all(&self.name)
            .iter()
            .any(|v| *v == self.value)
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug, Default)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }

    /// Compile the conditions of a route rule. Header conditions with an
    /// invalid name or value can never match and are reported as `None`.
    pub fn from_route(route: &RouteConfig) -> Option<Self> {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &route.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        if let Some(prefix) = &route.path_prefix {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
        }
        if let Some(header) = &route.header {
            let name = HeaderName::from_bytes(header.name.as_bytes()).ok()?;
            let value = HeaderValue::from_str(&header.value).ok()?;
            matchers.push(Box::new(HeaderMatcher::new(name, value)));
        }
        Some(Self::new(matchers))
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, head: &Parts) -> bool {
        self.matchers.iter().all(|m| m.matches(head))
    }
}
