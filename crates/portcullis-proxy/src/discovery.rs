//! Service discovery lookups and the per-route target cache.

use crate::host_list::HostList;
use crate::metrics;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Resolves a logical service endpoint to a list of backend hosts.
///
/// Implementations own the transport and any retry policy; the cache calls
/// `target` once per refresh.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn target(&self, query_endpoint: &str) -> anyhow::Result<HostList>;
}

/// Discovery backend used when none is configured; every lookup fails.
#[derive(Debug, Default)]
pub struct NoDiscovery;

#[async_trait]
impl ServiceDiscovery for NoDiscovery {
    async fn target(&self, query_endpoint: &str) -> anyhow::Result<HostList> {
        anyhow::bail!("no service discovery backend configured for '{query_endpoint}'")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("service discovery lookup failed: {0:#}")]
    Discovery(anyhow::Error),
    #[error("service refresh in progress and no previous host list is available")]
    RefreshInProgress,
}

#[derive(Debug)]
struct CacheEntry {
    hosts: HostList,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Clears the refresh flag on every exit path, including errors and panics.
struct RefreshGuard<'a>(&'a AtomicBool);

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Time-bounded cache of one route's discovered hosts.
///
/// At most one refresh runs at a time. Callers that miss the cache while a
/// refresh is running get the last good list instead of waiting.
#[derive(Debug)]
pub struct TargetCache {
    api_id: String,
    query_endpoint: String,
    ttl: Duration,
    entry: ArcSwapOption<CacheEntry>,
    last_good: ArcSwapOption<HostList>,
    has_run: AtomicBool,
    refreshing: AtomicBool,
}

impl TargetCache {
    pub fn new(api_id: impl Into<String>, query_endpoint: impl Into<String>, ttl: Duration) -> Self {
        Self {
            api_id: api_id.into(),
            query_endpoint: query_endpoint.into(),
            ttl,
            entry: ArcSwapOption::empty(),
            last_good: ArcSwapOption::empty(),
            has_run: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn query_endpoint(&self) -> &str {
        &self.query_endpoint
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    pub async fn resolve(&self, discovery: &dyn ServiceDiscovery) -> Result<HostList, ResolveError> {
        if !self.has_run.load(Ordering::Acquire) {
            debug!(api_id = %self.api_id, "First run, populating service cache");
            return self.refresh(discovery).await;
        }

        if let Some(hosts) = self.cached(Instant::now()) {
            debug!(api_id = %self.api_id, "Returning hosts from service cache");
            return Ok(hosts);
        }

        debug!(api_id = %self.api_id, "Service cache expired, refreshing");
        self.refresh(discovery).await
    }

    /// Drop the cached entry so the next request re-resolves.
    pub fn invalidate(&self) {
        self.entry.store(None);
    }

    /// Drop the cached entry if it has expired. Returns true if one was removed.
    pub fn purge_expired(&self, now: Instant) -> bool {
        let expired = matches!(&*self.entry.load(), Some(entry) if !entry.is_live(now));
        if expired {
            self.entry.store(None);
        }
        expired
    }

    pub fn last_good(&self) -> Option<HostList> {
        self.last_good.load_full().map(|hosts| (*hosts).clone())
    }

    fn cached(&self, now: Instant) -> Option<HostList> {
        match &*self.entry.load() {
            Some(entry) if entry.is_live(now) => Some(entry.hosts.clone()),
            _ => None,
        }
    }

    async fn refresh(&self, discovery: &dyn ServiceDiscovery) -> Result<HostList, ResolveError> {
        let Some(_guard) = RefreshGuard::acquire(&self.refreshing) else {
            debug!(api_id = %self.api_id, "Service refresh already in progress, using last good hosts");
            return self.last_good().ok_or(ResolveError::RefreshInProgress);
        };

        let data = match discovery.target(&self.query_endpoint).await {
            Ok(data) => data,
            Err(e) => {
                metrics::record_discovery_refresh(&self.api_id, "error");
                return match self.last_good() {
                    Some(hosts) => {
                        warn!(
                            api_id = %self.api_id,
                            "Service discovery failed, returning last good host list: {:#}", e
                        );
                        Ok(hosts)
                    }
                    None => Err(ResolveError::Discovery(e)),
                };
            }
        };

        if data.is_empty() {
            metrics::record_discovery_refresh(&self.api_id, "empty");
            self.has_run.store(true, Ordering::Release);
            warn!(
                api_id = %self.api_id,
                "Service discovery returned empty host list, returning last good set"
            );
            return Ok(match self.last_good() {
                Some(hosts) => hosts,
                None => {
                    warn!(api_id = %self.api_id, "Last good host list is empty");
                    let empty = HostList::empty();
                    self.last_good.store(Some(Arc::new(empty.clone())));
                    empty
                }
            });
        }

        metrics::record_discovery_refresh(&self.api_id, "ok");
        self.entry.store(Some(Arc::new(CacheEntry {
            hosts: data.clone(),
            expires_at: Instant::now() + self.ttl,
        })));
        self.last_good.store(Some(Arc::new(data.clone())));
        self.has_run.store(true, Ordering::Release);
        Ok(data)
    }
}
