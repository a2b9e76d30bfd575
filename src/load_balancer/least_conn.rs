//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, Strategy};

/// Least connections selector.
/// Selects the backend with the fewest active connections per unit of weight.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Strategy for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // a/wa < b/wb  <=>  a*wb < b*wa; ties keep the first (stability)
        backends
            .iter()
            .min_by(|a, b| {
                let lhs = a.active_connections() as u64 * b.weight as u64;
                let rhs = b.active_connections() as u64 * a.weight as u64;
                lhs.cmp(&rhs)
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthThresholds;

    fn backend(port: u16, weight: u32) -> Arc<Backend> {
        let addr = format!("127.0.0.1:{port}").parse().unwrap();
        Arc::new(Backend::new(port.to_string(), addr, weight, HealthThresholds::default()))
    }

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();
        let b1 = backend(8080, 1);
        let b2 = backend(8081, 1);
        let backends = vec![b1.clone(), b2.clone()];

        let _g1 = b1.connection_guard();
        assert_eq!(lb.next_server(&backends).unwrap().addr, b2.addr);

        let _g2 = b2.connection_guard();
        let _g3 = b2.connection_guard();
        assert_eq!(lb.next_server(&backends).unwrap().addr, b1.addr);
    }

    #[test]
    fn weight_scales_capacity() {
        let lb = LeastConnections::new();
        let big = backend(8080, 4);
        let small = backend(8081, 1);
        let backends = vec![small.clone(), big.clone()];

        let _guards: Vec<_> = (0..2).map(|_| big.connection_guard()).collect();
        let _s = small.connection_guard();
        // 2/4 < 1/1
        assert_eq!(lb.next_server(&backends).unwrap().addr, big.addr);
    }
}
