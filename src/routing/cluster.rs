//! Resolved cluster policy.
//!
//! A `Cluster` is the read-only view of a `[[clusters]]` entry that the
//! request path consults: retry level, timeouts, flush behaviour, outlier
//! policy and the settings its transport is built from. Backends live in
//! the balancer, not here. Cluster timeout overrides are merged over the
//! server timeouts here, once per configuration.

use crate::config::schema::{ClusterConfig, TimeoutConfig};
use crate::health::passive::{OutlierPolicy, PatternError};
use crate::proxy::streamer::FlushInterval;
use crate::resilience::retries::RetryLevel;
use crate::resilience::timeouts::Timeouts;
use crate::transport::{BackendProtocol, TransportSettings};

#[derive(Debug, Clone)]
pub struct Cluster {
    pub name: String,
    pub protocol: BackendProtocol,
    pub retry_level: RetryLevel,
    pub timeouts: Timeouts,
    pub flush: FlushInterval,
    pub cancel_on_client_close: bool,
    pub outlier: OutlierPolicy,
    pub transport: TransportSettings,
}

impl Cluster {
    pub fn from_config(config: &ClusterConfig, defaults: &TimeoutConfig) -> Result<Self, PatternError> {
        let timeouts = Timeouts::from(&config.timeouts.merged(defaults));
        Ok(Self {
            name: config.name.clone(),
            protocol: config.protocol,
            retry_level: config.retry_level,
            timeouts,
            flush: FlushInterval::from_millis(config.flush_interval_ms),
            cancel_on_client_close: config.cancel_on_client_close,
            outlier: OutlierPolicy::parse(&config.outlier.fail_statuses)?,
            transport: TransportSettings {
                protocol: config.protocol,
                connect_timeout: timeouts.connect,
                response_header_timeout: timeouts.response_header,
                pool: config.pool.clone(),
                fcgi: config.fcgi.clone(),
            },
        })
    }
}
