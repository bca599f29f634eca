//! Round-robin target selection with liveness-aware failover.

use crate::host_list::{HostIndexError, HostList};
use crate::liveness::HostChecker;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, error};

/// Matches `http://` and `https://`, case-insensitive.
static HTTP_SCHEME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i)https?://").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum LoadBalanceError {
    #[error("no upstream hosts available: {0}")]
    NoHosts(#[from] HostIndexError),
}

/// Prefix `http://` to hosts that carry no scheme.
pub fn ensure_transport(host: &str) -> String {
    if HTTP_SCHEME.is_match(host) {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

#[derive(Debug, Default)]
struct Cursor {
    pos: usize,
    len: usize,
}

/// Per-route round-robin cursor.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<Cursor>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Align the tracked length with `len` and return the current position,
    /// advancing the cursor for the next caller.
    pub fn next_start(&self, len: usize) -> usize {
        let mut cursor = self.cursor.lock();
        cursor.len = len;
        if cursor.pos >= len {
            cursor.pos = 0;
        }
        let start = cursor.pos;
        cursor.pos = if len == 0 { 0 } else { (start + 1) % len };
        start
    }
}

/// Per-route balancing switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalancePolicy {
    pub enabled: bool,
    pub check_liveness: bool,
}

/// Pick the upstream for one request.
///
/// With balancing disabled the first host is always used. Otherwise hosts are
/// probed in order from the cursor's position; when every host is marked down
/// the last probed host is returned anyway.
pub fn select_target(
    hosts: &HostList,
    policy: BalancePolicy,
    cursor: &RoundRobin,
    checker: &dyn HostChecker,
) -> Result<String, LoadBalanceError> {
    if !policy.enabled {
        debug!("Load balancing disabled, using first target of {:?}", hosts);
        return Ok(ensure_transport(hosts.get(0)?));
    }

    debug!("Load balancer enabled, getting upstream target");
    let start = cursor.next_start(hosts.len());
    let mut pos = start;
    loop {
        let host = ensure_transport(hosts.get(pos)?);

        if !policy.check_liveness || !checker.is_host_down(&host) {
            return Ok(host);
        }

        pos = (pos + 1) % hosts.len();
        if pos == start {
            error!("All hosts seem to be down, all uptime tests are failing!");
            return Ok(host);
        }
    }
}
