//! Weighted round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, Strategy};

/// Round-robin selector.
/// Stores an internal counter to rotate through backends; a backend with
/// weight `w` takes `w` consecutive slots of the rotation.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let total: usize = backends.iter().map(|b| b.weight as usize).sum();
        if total == 0 {
            return None;
        }

        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for backend in backends {
            let weight = backend.weight as usize;
            if slot < weight {
                return Some(backend.clone());
            }
            slot -= weight;
        }
        None
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
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let b1 = backend(8080, 1);
        let b2 = backend(8081, 1);
        let backends = vec![b1.clone(), b2.clone()];

        assert_eq!(lb.next_server(&backends).unwrap().addr, b1.addr);
        assert_eq!(lb.next_server(&backends).unwrap().addr, b2.addr);
        assert_eq!(lb.next_server(&backends).unwrap().addr, b1.addr);
    }

    #[test]
    fn weights_share_the_rotation() {
        let lb = RoundRobin::new();
        let heavy = backend(8080, 3);
        let light = backend(8081, 1);
        let backends = vec![heavy.clone(), light.clone()];

        let picks: Vec<u16> = (0..8)
            .map(|_| lb.next_server(&backends).unwrap().addr.port())
            .collect();
        assert_eq!(picks.iter().filter(|p| **p == 8080).count(), 6);
        assert_eq!(picks.iter().filter(|p| **p == 8081).count(), 2);
    }

    #[test]
    fn empty_pool() {
        assert!(RoundRobin::new().next_server(&[]).is_none());
    }
}
