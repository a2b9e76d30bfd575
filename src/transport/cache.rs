//! Per-cluster transport cache.
//!
//! # Responsibilities
//! - Hand out the transport for a cluster, building it on first use
//! - Replace (never mutate) a transport whose settings changed
//! - Forget transports of clusters removed by a reload
//!
//! # Design Decisions
//! - Read path takes only the read lock and clones an `Arc`
//! - Write path re-checks under the write lock so concurrent first uses
//!   publish a single instance

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::routing::cluster::Cluster;
use crate::transport::{build_transport, Transport, TransportSettings};

/// Builds a transport from settings; swapped out in tests.
pub type TransportFactory = Arc<dyn Fn(&TransportSettings) -> Arc<dyn Transport> + Send + Sync>;

struct Entry {
    settings: TransportSettings,
    transport: Arc<dyn Transport>,
}

/// Cluster name → transport.
pub struct TransportCache {
    entries: RwLock<HashMap<String, Entry>>,
    factory: TransportFactory,
}

impl fmt::Debug for TransportCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCache")
            .field("clusters", &self.len())
            .finish()
    }
}

impl Default for TransportCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportCache {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(build_transport))
    }

    pub fn with_factory(factory: TransportFactory) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Transport for `cluster`, built or rebuilt when its settings differ
    /// from the cached ones.
    pub fn get_or_create(&self, cluster: &Cluster) -> Arc<dyn Transport> {
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(&cluster.name) {
                if entry.settings == cluster.transport {
                    return entry.transport.clone();
                }
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(&cluster.name) {
            if entry.settings == cluster.transport {
                return entry.transport.clone();
            }
        }

        let transport = (self.factory)(&cluster.transport);
        let replaced = entries
            .insert(
                cluster.name.clone(),
                Entry {
                    settings: cluster.transport.clone(),
                    transport: transport.clone(),
                },
            )
            .is_some();
        metrics::counter!("proxy_transports_created_total", "cluster" => cluster.name.clone())
            .increment(1);
        tracing::debug!(
            cluster = %cluster.name,
            protocol = cluster.transport.protocol.as_str(),
            replaced,
            "Built backend transport"
        );
        transport
    }

    /// Bring the cache in line with a freshly loaded cluster set: drop
    /// entries for clusters that no longer exist and rebuild entries whose
    /// settings changed.
    pub fn refresh<'a>(&self, clusters: impl IntoIterator<Item = &'a Cluster>) {
        let clusters: HashMap<&str, &Cluster> =
            clusters.into_iter().map(|c| (c.name.as_str(), c)).collect();

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|name, _| clusters.contains_key(name.as_str()));
        for (name, entry) in entries.iter_mut() {
            let Some(cluster) = clusters.get(name.as_str()) else {
                continue;
            };
            if entry.settings != cluster.transport {
                *entry = Entry {
                    settings: cluster.transport.clone(),
                    transport: (self.factory)(&cluster.transport),
                };
                tracing::info!(cluster = %name, "Replaced backend transport after config change");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
