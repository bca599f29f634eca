//! Upstream transport, proxy behaviour and service discovery settings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    /// Dial timeout of the standard transport. Routes with a hard timeout
    /// dial with that timeout instead.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_keepalive_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

/// Gateway-wide forwarding behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyOptions {
    /// Upstream deadline used when no route-level hard timeout matches.
    /// 0 disables it.
    #[serde(default)]
    pub default_timeout_secs: u64,

    /// Answer every response with `Connection: close`.
    #[serde(default)]
    pub close_connections: bool,

    /// Periodic flush of streamed response bodies. 0 disables it.
    #[serde(default)]
    pub flush_interval_ms: u64,

    #[serde(default)]
    pub ssl_insecure_skip_verify: bool,

    #[serde(default = "default_enable_websockets")]
    pub enable_websockets: bool,

    /// Sent upstream when the client did not provide a User-Agent.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_enable_websockets() -> bool {
    true
}

pub(crate) fn default_user_agent() -> String {
    format!("portcullis/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            default_timeout_secs: 0,
            close_connections: false,
            flush_interval_ms: 0,
            ssl_insecure_skip_verify: false,
            enable_websockets: default_enable_websockets(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceDiscoveryConfig {
    /// Lifetime of a discovered host list, unless a route overrides it.
    #[serde(default = "default_cache_timeout")]
    pub default_cache_timeout_secs: u64,

    /// How often expired host lists are dropped.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_cache_timeout() -> u64 {
    120
}

fn default_cleanup_interval() -> u64 {
    15
}

impl Default for ServiceDiscoveryConfig {
    fn default() -> Self {
        Self {
            default_cache_timeout_secs: default_cache_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}
