//! Configuration types for the Portcullis gateway.

mod listen;
mod routing;
mod upstream;

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::path_table::PathTable;

pub use listen::{ListenConfig, MetricsConfig};
pub use routing::{BreakerRule, RouteConfig, RoutingMode, TimeoutRule};
pub(crate) use upstream::default_user_agent;
pub use upstream::{ConnectionPoolConfig, ProxyOptions, ServiceDiscoveryConfig};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: ListenConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub proxy: ProxyOptions,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default)]
    pub service_discovery: ServiceDiscoveryConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, anyhow::Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.service_discovery.cleanup_interval_secs == 0 {
            anyhow::bail!("service_discovery.cleanup_interval_secs must be greater than 0");
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.id.as_str()) {
                anyhow::bail!("Duplicate route id '{}'", route.id);
            }
            validate_route(route)?;
        }

        Ok(())
    }
}

fn validate_route(route: &RouteConfig) -> Result<(), anyhow::Error> {
    if route.id.is_empty() {
        anyhow::bail!("Route id must not be empty");
    }
    if !route.listen_path.starts_with('/') {
        anyhow::bail!(
            "Route '{}': listen_path '{}' must start with '/'",
            route.id,
            route.listen_path
        );
    }

    match &route.routing {
        RoutingMode::Static { target_url } => {
            let uri: hyper::Uri = target_url.parse().map_err(|e| {
                anyhow::anyhow!("Route '{}': invalid target_url '{target_url}': {e}", route.id)
            })?;
            if uri.scheme().is_none() || uri.authority().is_none() {
                anyhow::bail!(
                    "Route '{}': target_url '{target_url}' must be an absolute URL",
                    route.id
                );
            }
        }
        RoutingMode::LoadBalanced { targets } => {
            if targets.is_empty() {
                anyhow::bail!("Route '{}': load_balanced routing needs at least one target", route.id);
            }
        }
        RoutingMode::ServiceDiscovery { query_endpoint, .. } => {
            if query_endpoint.is_empty() {
                anyhow::bail!("Route '{}': query_endpoint must not be empty", route.id);
            }
        }
    }

    let mut patterns = PathTable::new();
    for rule in &route.enforced_timeouts {
        patterns
            .insert(&rule.method, &rule.path, ())
            .map_err(|e| anyhow::anyhow!("Route '{}': hard timeout: {e}", route.id))?;
    }
    for rule in &route.circuit_breakers {
        if rule.failure_threshold == 0 {
            anyhow::bail!(
                "Route '{}': circuit breaker on '{}' needs a failure_threshold above 0",
                route.id,
                rule.path
            );
        }
        patterns
            .insert(&rule.method, &rule.path, ())
            .map_err(|e| anyhow::anyhow!("Route '{}': circuit breaker: {e}", route.id))?;
    }

    Ok(())
}
