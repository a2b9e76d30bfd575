//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::LbPolicy;
    use crate::resilience::retries::RetryLevel;
    use crate::transport::BackendProtocol;

    const SAMPLE: &str = r#"
        [listener]
        bind_address = "127.0.0.1:8080"

        [timeouts]
        write_client_ms = 15000

        [[products]]
        name = "site"
        hosts = ["example.com", "*.example.org"]

        [[products.routes]]
        name = "api"
        path_prefix = "/api"
        cluster = "api"
        priority = 10

        [[clusters]]
        name = "api"
        protocol = "h2c"
        retry_level = "none"
        lb_policy = "least_conn"
        flush_interval_ms = -1

        [clusters.timeouts]
        connect_ms = 500

        [[clusters.backends]]
        address = "10.0.0.1:9000"
        weight = 3

        [[clusters.failover_backends]]
        address = "10.0.1.1:9000"
    "#;

    #[test]
    fn parses_full_document() {
        let config = parse_config(SAMPLE).unwrap();
        let cluster = &config.clusters[0];
        assert_eq!(cluster.protocol, BackendProtocol::H2c);
        assert_eq!(cluster.retry_level, RetryLevel::None);
        assert_eq!(cluster.lb_policy, LbPolicy::LeastConn);
        assert_eq!(cluster.flush_interval_ms, -1);
        assert_eq!(cluster.timeouts.connect_ms, Some(500));
        // untouched fields inherit the server timeouts
        assert_eq!(cluster.timeouts.write_client_ms, None);
        let merged = cluster.timeouts.merged(&config.timeouts);
        assert_eq!(merged.write_client_ms, 15_000);
        assert_eq!(merged.read_client_again_ms, 60_000);
        assert_eq!(cluster.backends[0].weight, 3);
        assert_eq!(cluster.failover_backends.len(), 1);
        assert_eq!(config.products[0].routes[0].priority, 10);
    }

    #[test]
    fn surfaces_validation_errors() {
        let broken = SAMPLE.replace("cluster = \"api\"", "cluster = \"nope\"");
        match parse_config(&broken) {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn surfaces_parse_errors() {
        assert!(matches!(
            parse_config("[[clusters]]\nname = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
