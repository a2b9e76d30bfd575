//! Passive health checking (outlier detection).
//!
//! # Responsibilities
//! - Map backend response statuses to success/failure feedback
//!
//! # Design Decisions
//! - Patterns are exact codes (`503`) or classes (`5xx`)
//! - 4xx are NOT failures unless listed explicitly
//! - Transport errors are reported by the invoker, not here

use axum::http::StatusCode;

/// One status pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPattern {
    Exact(u16),
    Class(u8),
}

impl StatusPattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw.len() != 3 {
            return None;
        }
        if let Some(class) = raw.strip_suffix("xx") {
            let class: u8 = class.parse().ok()?;
            return (1..=5).contains(&class).then_some(StatusPattern::Class(class));
        }
        let code: u16 = raw.parse().ok()?;
        (100..=599).contains(&code).then_some(StatusPattern::Exact(code))
    }

    fn matches(self, status: StatusCode) -> bool {
        let code = status.as_u16();
        match self {
            StatusPattern::Exact(expected) => code == expected,
            StatusPattern::Class(class) => code / 100 == class as u16,
        }
    }
}

/// Error for an unparseable status pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status pattern `{0}`")]
pub struct PatternError(pub String);

/// Outlier policy of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutlierPolicy {
    fail_statuses: Vec<StatusPattern>,
}

impl OutlierPolicy {
    pub fn parse(patterns: &[String]) -> Result<Self, PatternError> {
        let fail_statuses = patterns
            .iter()
            .map(|p| StatusPattern::parse(p).ok_or_else(|| PatternError(p.clone())))
            .collect::<Result<_, _>>()?;
        Ok(Self { fail_statuses })
    }

    /// Whether a response with this status counts against the backend.
    pub fn is_failure(&self, status: StatusCode) -> bool {
        self.fail_statuses.iter().any(|p| p.matches(status))
    }
}
