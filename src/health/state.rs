//! Backend health state machine.
//!
//! # States
//! - Healthy: backend receives traffic
//! - Unhealthy: backend excluded from load balancing until its recovery
//!   window has passed, then probed with live traffic
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= failure_threshold
//! Unhealthy → Healthy: consecutive successes >= success_threshold
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// Thresholds driving state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub failure: usize,
    pub success: usize,
    pub recovery: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failure: 3,
            success: 1,
            recovery: Duration::from_secs(10),
        }
    }
}

/// Lock-free health tracker shared by all requests using a backend.
#[derive(Debug)]
pub struct HealthTracker {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
    /// Milliseconds since process start when the backend went unhealthy.
    unhealthy_since: AtomicU64,
    thresholds: HealthThresholds,
}

fn clock_millis() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
            unhealthy_since: AtomicU64::new(0),
            thresholds,
        }
    }

    pub fn state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// True if the backend may receive traffic now.
    pub fn is_available(&self) -> bool {
        if self.state() != HealthState::Unhealthy {
            return true;
        }
        let since = self.unhealthy_since.load(Ordering::Relaxed);
        clock_millis().saturating_sub(since) >= self.thresholds.recovery.as_millis() as u64
    }

    /// Record a success. Returns true on a transition to Healthy.
    pub fn record_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.state() == HealthState::Healthy {
            return false;
        }
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= self.thresholds.success {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let prev = self.state.swap(HealthState::Healthy as u8, Ordering::Relaxed);
            return prev != HealthState::Healthy as u8;
        }
        false
    }

    /// Record a failure. Returns true on a transition to Unhealthy.
    pub fn record_failure(&self) -> bool {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        if self.state() == HealthState::Unhealthy {
            // a failed probe restarts the recovery window
            self.unhealthy_since.store(clock_millis(), Ordering::Relaxed);
            return false;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.thresholds.failure {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.unhealthy_since.store(clock_millis(), Ordering::Relaxed);
            let prev = self.state.swap(HealthState::Unhealthy as u8, Ordering::Relaxed);
            return prev != HealthState::Unhealthy as u8;
        }
        false
    }
}
