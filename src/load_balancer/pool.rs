//! Backend pool management.
//!
//! # Responsibilities
//! - Hold the primary and failover backends of each cluster
//! - Apply the cluster's strategy to available backends
//! - Signal cross-cluster retry when only the failover pool is left

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::{BackendConfig, ClusterConfig};
use crate::health::state::HealthThresholds;
use crate::http::request::ProxyRequest;
use crate::load_balancer::{backend::Backend, BalanceError, Balancer, Strategy};

/// Balancer over one cluster's backends.
#[derive(Debug)]
pub struct ClusterBalancer {
    cluster: String,
    primary: Vec<Arc<Backend>>,
    failover: Vec<Arc<Backend>>,
    strategy: Box<dyn Strategy>,
}

impl ClusterBalancer {
    pub fn new(
        cluster: impl Into<String>,
        primary: Vec<Arc<Backend>>,
        failover: Vec<Arc<Backend>>,
        strategy: Box<dyn Strategy>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            primary,
            failover,
            strategy,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        let thresholds = HealthThresholds {
            failure: config.outlier.failure_threshold.max(1) as usize,
            success: config.outlier.success_threshold.max(1) as usize,
            recovery: Duration::from_secs(config.outlier.recovery_secs),
        };
        let build = |configs: &[BackendConfig]| -> Vec<Arc<Backend>> {
            configs
                .iter()
                .filter_map(|b| match Backend::from_config(b, thresholds) {
                    Ok(backend) => Some(Arc::new(backend)),
                    Err(_) => {
                        tracing::warn!(cluster = %config.name, address = %b.address, "Invalid backend address");
                        None
                    }
                })
                .collect()
        };
        Self::new(
            config.name.clone(),
            build(&config.backends),
            build(&config.failover_backends),
            config.lb_policy.strategy(),
        )
    }

    fn pick(&self, pool: &[Arc<Backend>], avoid: Option<&Arc<Backend>>) -> Option<Arc<Backend>> {
        let available: Vec<Arc<Backend>> = pool.iter().filter(|b| b.is_available()).cloned().collect();
        if let Some(avoid) = avoid {
            let others: Vec<Arc<Backend>> = available
                .iter()
                .filter(|b| !Arc::ptr_eq(b, avoid))
                .cloned()
                .collect();
            if !others.is_empty() {
                return self.strategy.next_server(&others);
            }
        }
        self.strategy.next_server(&available)
    }
}

impl Balancer for ClusterBalancer {
    fn balance(&self, req: &ProxyRequest) -> Result<Arc<Backend>, BalanceError> {
        // the backend of the previous failed attempt is still bound
        let avoid = req.trans.as_ref().map(|t| t.guard.backend());
        let pool = if req.cross_cluster_retry {
            &self.failover
        } else {
            &self.primary
        };

        if let Some(backend) = self.pick(pool, avoid) {
            return Ok(backend);
        }

        if !req.cross_cluster_retry && !self.failover.is_empty() {
            return Err(BalanceError::CrossClusterRetry);
        }

        tracing::debug!(cluster = %self.cluster, backend_count = pool.len(), "No available backends");
        for b in pool {
            tracing::debug!(addr = %b.addr, state = b.health_state().as_str(), "Backend status");
        }
        Err(BalanceError::NoBackend(self.cluster.clone()))
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.primary.iter().chain(&self.failover).cloned().collect()
    }
}

/// Cluster name → balancer.
#[derive(Debug, Default)]
pub struct BalancerTable {
    balancers: HashMap<String, Arc<dyn Balancer>>,
}

impl BalancerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(clusters: &[ClusterConfig]) -> Self {
        let mut table = Self::new();
        for cluster in clusters {
            table.insert(cluster.name.clone(), Arc::new(ClusterBalancer::from_config(cluster)));
        }
        table
    }

    pub fn insert(&mut self, cluster: impl Into<String>, balancer: Arc<dyn Balancer>) {
        self.balancers.insert(cluster.into(), balancer);
    }

    pub fn get(&self, cluster: &str) -> Option<Arc<dyn Balancer>> {
        self.balancers.get(cluster).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Balancer>)> {
        self.balancers.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::tests::request;
    use crate::load_balancer::round_robin::RoundRobin;

    fn backend(port: u16, failure: usize) -> Arc<Backend> {
        Arc::new(Backend::new(
            port.to_string(),
            format!("127.0.0.1:{port}").parse().unwrap(),
            1,
            HealthThresholds {
                failure,
                success: 1,
                recovery: Duration::from_secs(60),
            },
        ))
    }

    #[test]
    fn skips_unavailable_backends() {
        let b1 = backend(9001, 1);
        let b2 = backend(9002, 1);
        b1.on_fail();
        let lb = ClusterBalancer::new("web", vec![b1, b2.clone()], vec![], Box::new(RoundRobin::new()));
        let req = request("GET", "http://example.com/", &[]);
        for _ in 0..3 {
            assert_eq!(lb.balance(&req).unwrap().addr, b2.addr);
        }
    }

    #[test]
    fn avoids_backend_of_previous_attempt() {
        let b1 = backend(9001, 5);
        let b2 = backend(9002, 5);
        let lb = ClusterBalancer::new("web", vec![b1.clone(), b2.clone()], vec![], Box::new(RoundRobin::new()));
        let mut req = request("GET", "http://example.com/", &[]);

        let first = lb.balance(&req).unwrap();
        req.trans = Some(crate::http::request::BackendTrans::for_test(&first));
        let second = lb.balance(&req).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn exhausted_primary_asks_for_cross_cluster_retry() {
        let b1 = backend(9001, 1);
        let spare = backend(9100, 1);
        b1.on_fail();
        let lb = ClusterBalancer::new("web", vec![b1], vec![spare.clone()], Box::new(RoundRobin::new()));
        let mut req = request("GET", "http://example.com/", &[]);

        assert_eq!(lb.balance(&req).unwrap_err(), BalanceError::CrossClusterRetry);
        req.cross_cluster_retry = true;
        assert_eq!(lb.balance(&req).unwrap().addr, spare.addr);

        spare.on_fail();
        assert_eq!(
            lb.balance(&req).unwrap_err(),
            BalanceError::NoBackend("web".into())
        );
    }

    #[test]
    fn table_from_config() {
        let cluster = ClusterConfig {
            name: "api".into(),
            backends: vec![BackendConfig::new("127.0.0.1:9001"), BackendConfig::new("127.0.0.1:9002")],
            failover_backends: vec![BackendConfig::new("127.0.0.1:9003")],
            ..Default::default()
        };
        let table = BalancerTable::from_config(&[cluster]);
        assert_eq!(table.get("api").unwrap().backends().len(), 3);
        assert!(table.get("web").is_none());
        assert_eq!(table.iter().count(), 1);
    }
}
