//! Host liveness lookups.
//!
//! The proxy never probes backends itself. An external uptime checker marks
//! hosts up or down, and the load balancer only asks whether a host is
//! currently marked down.

use parking_lot::RwLock;
use std::collections::HashSet;

/// Read-only view of backend liveness.
pub trait HostChecker: Send + Sync {
    /// Returns true when the given backend URI is currently marked down.
    fn is_host_down(&self, uri: &str) -> bool;
}

/// Checker that reports every host as up.
#[derive(Debug, Default)]
pub struct NeverDown;

impl HostChecker for NeverDown {
    fn is_host_down(&self, _uri: &str) -> bool {
        false
    }
}

/// Shared set of hosts marked down by an external prober.
#[derive(Debug, Default)]
pub struct HostStatusRegistry {
    down: RwLock<HashSet<String>>,
}

impl HostStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_down(&self, uri: impl Into<String>) {
        let uri = uri.into();
        tracing::debug!("Host marked down: {}", uri);
        self.down.write().insert(uri);
    }

    pub fn mark_up(&self, uri: &str) {
        if self.down.write().remove(uri) {
            tracing::debug!("Host marked up: {}", uri);
        }
    }

    pub fn down_count(&self) -> usize {
        self.down.read().len()
    }
}

impl HostChecker for HostStatusRegistry {
    fn is_host_down(&self, uri: &str) -> bool {
        self.down.read().contains(uri)
    }
}
