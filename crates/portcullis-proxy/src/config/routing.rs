//! Route (API definition) configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub name: String,
    /// Inbound path prefix served by this route.
    pub listen_path: String,
    #[serde(default)]
    pub strip_listen_path: bool,

    pub routing: RoutingMode,

    /// Skip hosts that the uptime checker has marked down.
    #[serde(default)]
    pub check_host_against_uptime_tests: bool,
    #[serde(default)]
    pub preserve_host_header: bool,
    /// Honour the retain-host marker left by an earlier URL rewrite.
    #[serde(default)]
    pub url_rewrite_enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enforced_timeouts: Vec<TimeoutRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub circuit_breakers: Vec<BreakerRule>,

    #[serde(default)]
    pub response_handlers_active: bool,
    /// Headers injected into every response when response handlers are active.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
}

/// Where a route's traffic goes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingMode {
    /// One fixed upstream URL.
    Static { target_url: String },
    /// Round-robin over a fixed list of hosts.
    LoadBalanced { targets: Vec<String> },
    /// Hosts resolved through the discovery service and cached.
    ServiceDiscovery {
        query_endpoint: String,
        #[serde(default)]
        load_balancing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutRule {
    #[serde(default)]
    pub method: String,
    pub path: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerRule {
    #[serde(default)]
    pub method: String,
    pub path: String,
    pub failure_threshold: u32,
    #[serde(default = "default_return_to_service")]
    pub return_to_service_after_secs: u64,
}

fn default_return_to_service() -> u64 {
    30
}
