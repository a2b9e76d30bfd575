use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub active_connections: u64,
    pub clusters: usize,
    pub transports: usize,
}

#[derive(Debug, Serialize)]
pub struct ClusterStatus {
    pub name: String,
    pub protocol: &'static str,
    pub retry_level: crate::resilience::retries::RetryLevel,
    pub backends: usize,
    pub available_backends: usize,
}

#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub cluster: String,
    pub name: String,
    pub address: String,
    pub health: &'static str,
    pub available: bool,
    pub active_connections: usize,
    pub success_total: u64,
    pub failure_total: u64,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let tables = state.engine.tables();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if state.engine.is_draining() {
            "draining"
        } else {
            "operational"
        },
        uptime_secs: state.started.elapsed().as_secs(),
        active_connections: state.connections.active_count(),
        clusters: tables.clusters.len(),
        transports: state.engine.transports().len(),
    })
}

pub async fn get_clusters(State(state): State<AdminState>) -> Json<Vec<ClusterStatus>> {
    let tables = state.engine.tables();
    let mut clusters: Vec<ClusterStatus> = tables
        .clusters
        .iter()
        .map(|cluster| {
            let backends = tables
                .balancers
                .get(&cluster.name)
                .map(|b| b.backends())
                .unwrap_or_default();
            ClusterStatus {
                name: cluster.name.clone(),
                protocol: cluster.protocol.as_str(),
                retry_level: cluster.retry_level,
                backends: backends.len(),
                available_backends: backends.iter().filter(|b| b.is_available()).count(),
            }
        })
        .collect();
    clusters.sort_by(|a, b| a.name.cmp(&b.name));
    Json(clusters)
}

pub async fn get_backends(State(state): State<AdminState>) -> Json<Vec<BackendStatus>> {
    let tables = state.engine.tables();
    let mut statuses = Vec::new();
    for (cluster, balancer) in tables.balancers.iter() {
        for b in balancer.backends() {
            statuses.push(BackendStatus {
                cluster: cluster.to_string(),
                name: b.name.clone(),
                address: b.addr.to_string(),
                health: b.health_state().as_str(),
                available: b.is_available(),
                active_connections: b.active_connections(),
                success_total: b.success_total(),
                failure_total: b.failure_total(),
            });
        }
    }
    statuses.sort_by(|a, b| (&a.cluster, &a.address).cmp(&(&b.cluster, &b.address)));
    Json(statuses)
}
