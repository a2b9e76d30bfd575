//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Map the request host to a product
//! - Walk the product's routes to a cluster name
//! - Look up resolved cluster policy by name
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks); reloads
//!   build a new table
//! - O(1) exact host lookup via HashMap, then wildcard suffixes, then the
//!   `*` default product
//! - Filter overrides placed in the request context win over the tables
//! - Explicit NoMatch rather than silent default

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::schema::{ProductConfig, ProxyConfig};
use crate::filter::context::keys;
use crate::health::passive::PatternError;
use crate::http::request::ProxyRequest;
use crate::routing::cluster::Cluster;
use crate::routing::matcher::{request_host, AndMatcher, Matcher};
use crate::routing::{ClusterResolver, RouteError};

#[derive(Debug)]
struct Route {
    name: String,
    cluster: String,
    matcher: AndMatcher,
}

#[derive(Debug)]
struct Product {
    routes: Vec<Route>,
}

/// Host and route tables plus the cluster registry.
#[derive(Debug, Default)]
pub struct RouteTable {
    products: HashMap<String, Product>,
    exact_hosts: HashMap<String, String>,
    /// `(".example.com", product)`, longest suffix first.
    wildcard_hosts: Vec<(String, String)>,
    default_product: Option<String>,
    clusters: HashMap<String, Arc<Cluster>>,
}

impl RouteTable {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, PatternError> {
        let clusters = config
            .clusters
            .iter()
            .map(|c| Cluster::from_config(c, &config.timeouts).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(&config.products, clusters))
    }

    pub fn new(products: &[ProductConfig], clusters: Vec<Arc<Cluster>>) -> Self {
        let mut table = Self {
            clusters: clusters.into_iter().map(|c| (c.name.clone(), c)).collect(),
            ..Default::default()
        };

        for product in products {
            for host in &product.hosts {
                let host = host.to_ascii_lowercase();
                if host == "*" {
                    table.default_product = Some(product.name.clone());
                } else if let Some(suffix) = host.strip_prefix('*') {
                    table
                        .wildcard_hosts
                        .push((suffix.to_string(), product.name.clone()));
                } else {
                    table.exact_hosts.insert(host, product.name.clone());
                }
            }

            let mut rules: Vec<_> = product.routes.iter().collect();
            // stable: equal priorities keep file order
            rules.sort_by(|a, b| b.priority.cmp(&a.priority));
            let routes = rules
                .into_iter()
                .filter_map(|rule| match AndMatcher::from_route(rule) {
                    Some(matcher) => Some(Route {
                        name: rule.name.clone(),
                        cluster: rule.cluster.clone(),
                        matcher,
                    }),
                    None => {
                        tracing::warn!(
                            product = %product.name,
                            route = %rule.name,
                            "Skipping route with an invalid header condition"
                        );
                        None
                    }
                })
                .collect();
            table
                .products
                .insert(product.name.clone(), Product { routes });
        }

        table
            .wildcard_hosts
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        table
    }

    /// Every cluster known to this table.
    pub fn clusters(&self) -> impl Iterator<Item = &Arc<Cluster>> {
        self.clusters.values()
    }

    fn product_for_host(&self, host: &str) -> Option<&str> {
        if let Some(product) = self.exact_hosts.get(host) {
            return Some(product);
        }
        self.wildcard_hosts
            .iter()
            .find(|(suffix, _)| host.ends_with(suffix.as_str()) && host.len() > suffix.len())
            .map(|(_, product)| product.as_str())
            .or(self.default_product.as_deref())
    }
}

impl ClusterResolver for RouteTable {
    fn find_product(&self, req: &mut ProxyRequest) -> Result<(), RouteError> {
        if let Some(name) = req.context.get(&keys::PRODUCT_OVERRIDE) {
            if !self.products.contains_key(name) {
                return Err(RouteError::UnknownProduct(name.clone()));
            }
            req.route.product = Some(name.clone());
            return Ok(());
        }

        let host = request_host(&req.head).unwrap_or_default();
        let product = self
            .product_for_host(&host)
            .ok_or_else(|| RouteError::NoProduct(host.clone()))?;
        req.route.product = Some(product.to_string());
        Ok(())
    }

    fn find_cluster(&self, req: &mut ProxyRequest) -> Result<(), RouteError> {
        if let Some(name) = req.context.get(&keys::CLUSTER_OVERRIDE) {
            let name = name.clone();
            self.lookup(&name)?;
            req.route.cluster_name = Some(name);
            return Ok(());
        }

        let product_name = req
            .route
            .product
            .clone()
            .ok_or(RouteError::ProductUnresolved)?;
        let product = self
            .products
            .get(&product_name)
            .ok_or_else(|| RouteError::UnknownProduct(product_name.clone()))?;

        let route = product
            .routes
            .iter()
            .find(|r| r.matcher.matches(&req.head))
            .ok_or_else(|| RouteError::NoRoute {
                product: product_name.clone(),
                path: req.head.uri.path().to_string(),
            })?;

        tracing::trace!(product = %product_name, route = %route.name, cluster = %route.cluster, "Route matched");
        req.route.cluster_name = Some(route.cluster.clone());
        Ok(())
    }

    fn lookup(&self, cluster: &str) -> Result<Arc<Cluster>, RouteError> {
        self.clusters
            .get(cluster)
            .cloned()
            .ok_or_else(|| RouteError::UnknownCluster(cluster.to_string()))
    }
}
