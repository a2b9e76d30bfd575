//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing clusters)
//! - Validate value ranges and addresses
//! - Reject zero timeouts, except the idle timeout where zero means no limit
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use crate::config::schema::{BackendConfig, ClusterTimeoutConfig, ProxyConfig, TimeoutConfig};
use crate::health::passive::OutlierPolicy;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid bind address `{0}`")]
    BindAddress(String),
    #[error("duplicate cluster `{0}`")]
    DuplicateCluster(String),
    #[error("duplicate product `{0}`")]
    DuplicateProduct(String),
    #[error("host `{host}` is claimed by more than one product")]
    DuplicateHost { host: String },
    #[error("cluster `{0}` has no backends")]
    EmptyCluster(String),
    #[error("cluster `{cluster}`: invalid backend address `{address}`")]
    BackendAddress { cluster: String, address: String },
    #[error("cluster `{cluster}`: invalid outlier status pattern `{pattern}`")]
    OutlierPattern { cluster: String, pattern: String },
    #[error("cluster `{cluster}`: outlier thresholds must be positive")]
    OutlierThreshold { cluster: String },
    #[error("product `{product}` route `{route}` references unknown cluster `{cluster}`")]
    UnknownCluster {
        product: String,
        route: String,
        cluster: String,
    },
    #[error("redirect for `{prefix}` uses non-redirect status {status}")]
    RedirectStatus { prefix: String, status: u16 },
    #[error("invalid blocked client ip `{0}`")]
    BlockedIp(String),
    #[error("{scope}: `{field}` must be greater than zero")]
    ZeroTimeout { scope: String, field: &'static str },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    check_timeouts("timeouts", &config.timeouts, &mut errors);

    let mut clusters = HashSet::new();
    for cluster in &config.clusters {
        if !clusters.insert(cluster.name.as_str()) {
            errors.push(ValidationError::DuplicateCluster(cluster.name.clone()));
        }
        if cluster.backends.is_empty() {
            errors.push(ValidationError::EmptyCluster(cluster.name.clone()));
        }
        check_backends(&cluster.name, &cluster.backends, &mut errors);
        check_backends(&cluster.name, &cluster.failover_backends, &mut errors);
        check_cluster_timeouts(&cluster.name, &cluster.timeouts, &mut errors);

        for pattern in &cluster.outlier.fail_statuses {
            if OutlierPolicy::parse(std::slice::from_ref(pattern)).is_err() {
                errors.push(ValidationError::OutlierPattern {
                    cluster: cluster.name.clone(),
                    pattern: pattern.clone(),
                });
            }
        }
        if cluster.outlier.failure_threshold == 0 || cluster.outlier.success_threshold == 0 {
            errors.push(ValidationError::OutlierThreshold {
                cluster: cluster.name.clone(),
            });
        }
    }

    let mut products = HashSet::new();
    let mut hosts = HashSet::new();
    for product in &config.products {
        if !products.insert(product.name.as_str()) {
            errors.push(ValidationError::DuplicateProduct(product.name.clone()));
        }
        for host in &product.hosts {
            if !hosts.insert(host.to_ascii_lowercase()) {
                errors.push(ValidationError::DuplicateHost { host: host.clone() });
            }
        }
        for route in &product.routes {
            if !clusters.contains(route.cluster.as_str()) {
                errors.push(ValidationError::UnknownCluster {
                    product: product.name.clone(),
                    route: route.name.clone(),
                    cluster: route.cluster.clone(),
                });
            }
        }
    }

    for rule in &config.modules.redirect {
        if !(300..400).contains(&rule.status) {
            errors.push(ValidationError::RedirectStatus {
                prefix: rule.prefix.clone(),
                status: rule.status,
            });
        }
    }
    for ip in &config.modules.block.client_ips {
        if ip.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::BlockedIp(ip.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Timeouts that bound a single step; zero would fail every request.
fn bounded_timeouts(
    connect: Option<u64>,
    response_header: Option<u64>,
    read_client: Option<u64>,
    write_client: Option<u64>,
) -> [(&'static str, Option<u64>); 4] {
    [
        ("connect_ms", connect),
        ("response_header_ms", response_header),
        ("read_client_ms", read_client),
        ("write_client_ms", write_client),
    ]
}

fn check_timeouts(scope: &str, timeouts: &TimeoutConfig, errors: &mut Vec<ValidationError>) {
    let fields = bounded_timeouts(
        Some(timeouts.connect_ms),
        Some(timeouts.response_header_ms),
        Some(timeouts.read_client_ms),
        Some(timeouts.write_client_ms),
    );
    push_zero_timeouts(scope, &fields, errors);
}

fn check_cluster_timeouts(cluster: &str, timeouts: &ClusterTimeoutConfig, errors: &mut Vec<ValidationError>) {
    let fields = bounded_timeouts(
        timeouts.connect_ms,
        timeouts.response_header_ms,
        timeouts.read_client_ms,
        timeouts.write_client_ms,
    );
    push_zero_timeouts(&format!("cluster `{cluster}` timeouts"), &fields, errors);
}

fn push_zero_timeouts(scope: &str, fields: &[(&'static str, Option<u64>)], errors: &mut Vec<ValidationError>) {
    for &(field, value) in fields {
        if value == Some(0) {
            errors.push(ValidationError::ZeroTimeout {
                scope: scope.to_string(),
                field,
            });
        }
    }
}

fn check_backends(cluster: &str, backends: &[BackendConfig], errors: &mut Vec<ValidationError>) {
    for backend in backends {
        if backend.address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::BackendAddress {
                cluster: cluster.to_string(),
                address: backend.address.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ClusterConfig, ProductConfig, RouteConfig};

    fn base_config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.clusters.push(ClusterConfig {
            name: "web".into(),
            backends: vec![BackendConfig::new("127.0.0.1:8001")],
            ..Default::default()
        });
        config.products.push(ProductConfig {
            name: "site".into(),
            hosts: vec!["example.com".into()],
            routes: vec![RouteConfig {
                name: "all".into(),
                host: None,
                path_prefix: Some("/".into()),
                header: None,
                cluster: "web".into(),
                priority: 0,
            }],
        });
        config
    }

    #[test]
    fn accepts_consistent_config() {
        assert_eq!(validate_config(&base_config()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = base_config();
        config.products[0].routes[0].cluster = "missing".into();
        config.clusters[0].backends.push(BackendConfig::new("not-an-address"));
        config.clusters[0].outlier.fail_statuses.push("9zz".into());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::UnknownCluster {
            product: "site".into(),
            route: "all".into(),
            cluster: "missing".into(),
        }));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut config = base_config();
        config.timeouts.response_header_ms = 0;
        config.timeouts.read_client_again_ms = 0;
        config.clusters[0].timeouts.connect_ms = Some(0);
        config.clusters[0].timeouts.read_client_again_ms = Some(0);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::ZeroTimeout {
                    scope: "timeouts".into(),
                    field: "response_header_ms",
                },
                ValidationError::ZeroTimeout {
                    scope: "cluster `web` timeouts".into(),
                    field: "connect_ms",
                },
            ]
        );
    }

    #[test]
    fn rejects_duplicate_hosts() {
        let mut config = base_config();
        config.products.push(ProductConfig {
            name: "other".into(),
            hosts: vec!["EXAMPLE.com".into()],
            routes: Vec::new(),
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateHost {
                host: "EXAMPLE.com".into()
            }]
        );
    }
}
