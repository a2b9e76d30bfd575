//! Built-in filter modules.
//!
//! # Data Flow
//! ```text
//! ModulesConfig
//!     → build_filter_table
//!         BeforeLocation: block    (client IP / path deny → Close)
//!         BeforeLocation: redirect (path prefix → Redirect)
//!         ReadResponse:   header   (static response headers)
//!     → FilterTable, published with the rest of the runtime snapshot
//! ```
//!
//! # Design Decisions
//! - A module with no configured rules is not registered at all
//! - Modules only talk to each other through the request context

pub mod block;
pub mod header;
pub mod redirect;

use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::filter::{FilterStage, FilterTable};

/// Filter table for the modules enabled in `config`.
pub fn build_filter_table(config: &ProxyConfig) -> FilterTable {
    let modules = &config.modules;
    let mut table = FilterTable::new();

    let block = block::BlockFilter::from_config(&modules.block);
    if !block.is_empty() {
        table.register(FilterStage::BeforeLocation, "mod_block", Arc::new(block));
    }

    let redirect = redirect::RedirectFilter::from_config(&modules.redirect);
    if !redirect.is_empty() {
        table.register(FilterStage::BeforeLocation, "mod_redirect", Arc::new(redirect));
    }

    let header = header::HeaderFilter::from_config(&modules.response_headers);
    if !header.is_empty() {
        table.register(FilterStage::ReadResponse, "mod_header", Arc::new(header));
    }

    tracing::debug!(filters = ?table, "Filter table built");
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RedirectRuleConfig;

    #[test]
    fn registers_only_configured_modules() {
        let mut config = ProxyConfig::default();
        assert_eq!(build_filter_table(&config).names(FilterStage::BeforeLocation).count(), 0);

        config.modules.block.path_prefixes.push("/admin".into());
        config.modules.redirect.push(RedirectRuleConfig {
            prefix: "/old".into(),
            location: "/new".into(),
            status: 301,
        });
        config
            .modules
            .response_headers
            .insert("x-served-by".into(), "edge".into());

        let table = build_filter_table(&config);
        let before: Vec<&str> = table.names(FilterStage::BeforeLocation).collect();
        assert_eq!(before, ["mod_block", "mod_redirect"]);
        assert_eq!(table.names(FilterStage::ReadResponse).count(), 1);
    }
}
