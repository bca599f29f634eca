//! Per-route runtime state and the registry that owns it.
//!
//! A `RouteRuntime` is built once when a route is loaded and holds everything
//! the proxy mutates per route: the round-robin cursor, the discovery cache
//! and the circuit breakers. Removing a route from the registry drops it.

use hyper::{Method, Uri};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::circuit_breaker::{BreakerSettings, CircuitBreaker};
use crate::config::{RouteConfig, RoutingMode, ServiceDiscoveryConfig};
use crate::discovery::{ResolveError, ServiceDiscovery, TargetCache};
use crate::host_list::HostList;
use crate::liveness::HostChecker;
use crate::load_balancer::{select_target, BalancePolicy, LoadBalanceError, RoundRobin};
use crate::path_table::{PathTable, PatternError};
use crate::proxy::chain::{ChainError, HeaderInjector, ResponseChain};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("invalid upstream target '{target}': {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Balance(#[from] LoadBalanceError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

enum Upstream {
    Static(Uri),
    Balanced(HostList),
    Discovered {
        cache: TargetCache,
        load_balancing: bool,
    },
}

pub struct RouteRuntime {
    config: RouteConfig,
    upstream: Upstream,
    cursor: RoundRobin,
    timeouts: PathTable<u64>,
    breakers: PathTable<Arc<CircuitBreaker>>,
    response_chain: Option<Arc<dyn ResponseChain>>,
}

impl std::fmt::Debug for RouteRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRuntime")
            .field("id", &self.config.id)
            .field("listen_path", &self.config.listen_path)
            .field("timeouts", &self.timeouts.len())
            .field("breakers", &self.breakers.len())
            .finish()
    }
}

impl RouteRuntime {
    pub fn new(config: RouteConfig, discovery: &ServiceDiscoveryConfig) -> Result<Self, RouteError> {
        let upstream = match &config.routing {
            RoutingMode::Static { target_url } => Upstream::Static(parse_target(target_url)?),
            RoutingMode::LoadBalanced { targets } => {
                Upstream::Balanced(HostList::new(targets.iter().cloned()))
            }
            RoutingMode::ServiceDiscovery {
                query_endpoint,
                load_balancing,
                cache_timeout_secs,
            } => {
                let ttl = Duration::from_secs(
                    cache_timeout_secs.unwrap_or(discovery.default_cache_timeout_secs),
                );
                Upstream::Discovered {
                    cache: TargetCache::new(config.id.clone(), query_endpoint.clone(), ttl),
                    load_balancing: *load_balancing,
                }
            }
        };

        let mut timeouts = PathTable::new();
        for rule in &config.enforced_timeouts {
            timeouts.insert(&rule.method, &rule.path, rule.timeout_secs)?;
        }

        let mut breakers = PathTable::new();
        for rule in &config.circuit_breakers {
            let breaker = CircuitBreaker::new(
                format!("{}:{} {}", config.id, rule.method, rule.path),
                BreakerSettings {
                    failure_threshold: rule.failure_threshold,
                    reset_after: Duration::from_secs(rule.return_to_service_after_secs),
                },
            );
            breakers.insert(&rule.method, &rule.path, Arc::new(breaker))?;
        }

        let response_chain: Option<Arc<dyn ResponseChain>> =
            if config.response_handlers_active && !config.response_headers.is_empty() {
                Some(Arc::new(HeaderInjector::new(&config.response_headers)?))
            } else {
                None
            };

        Ok(Self {
            config,
            upstream,
            cursor: RoundRobin::new(),
            timeouts,
            breakers,
            response_chain,
        })
    }

    /// Replace the response chain installed from configuration.
    pub fn with_response_chain(mut self, chain: Arc<dyn ResponseChain>) -> Self {
        self.response_chain = Some(chain);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn org_id(&self) -> &str {
        &self.config.org_id
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn response_chain(&self) -> Option<&Arc<dyn ResponseChain>> {
        self.response_chain
            .as_ref()
            .filter(|_| self.config.response_handlers_active)
    }

    pub fn uses_discovery(&self) -> bool {
        matches!(self.upstream, Upstream::Discovered { .. })
    }

    /// Resolve the upstream base URL for one request.
    pub async fn resolve_target(
        &self,
        discovery: &dyn ServiceDiscovery,
        checker: &dyn HostChecker,
    ) -> Result<Uri, RouteError> {
        let check_liveness = self.config.check_host_against_uptime_tests;
        let chosen = match &self.upstream {
            Upstream::Static(uri) => return Ok(uri.clone()),
            Upstream::Balanced(hosts) => {
                let policy = BalancePolicy {
                    enabled: true,
                    check_liveness,
                };
                select_target(hosts, policy, &self.cursor, checker)?
            }
            Upstream::Discovered {
                cache,
                load_balancing,
            } => {
                let hosts = cache.resolve(discovery).await?;
                let policy = BalancePolicy {
                    enabled: *load_balancing,
                    check_liveness,
                };
                select_target(&hosts, policy, &self.cursor, checker)?
            }
        };
        parse_target(&chosen)
    }

    /// Upstream deadline for this request; `None` means no deadline.
    pub fn effective_timeout(&self, method: &Method, path: &str, default_secs: u64) -> Option<Duration> {
        let secs = match self.timeouts.lookup(method, path) {
            Some(secs) => {
                debug!(api_id = %self.config.id, timeout_secs = *secs, "Hard timeout enforced");
                *secs
            }
            None => default_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn breaker_for(&self, method: &Method, path: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.lookup(method, path)
    }

    /// Force the next request to re-resolve discovered hosts.
    pub fn invalidate_discovery(&self) {
        if let Upstream::Discovered { cache, .. } = &self.upstream {
            debug!(api_id = %self.config.id, "Upstream host failed, refreshing host list");
            cache.invalidate();
        }
    }

    pub fn purge_expired(&self, now: Instant) -> bool {
        match &self.upstream {
            Upstream::Discovered { cache, .. } => cache.purge_expired(now),
            _ => false,
        }
    }

    /// Whether `path` falls under this route's listen path.
    pub fn matches_path(&self, path: &str) -> bool {
        listen_path_matches(&self.config.listen_path, path)
    }

    /// The path sent upstream: the listen path removed when configured.
    pub fn upstream_path<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        if !self.config.strip_listen_path {
            return path.into();
        }
        let prefix = self.config.listen_path.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) if rest.starts_with('/') => rest.into(),
            Some(rest) => format!("/{rest}").into(),
            None => path.into(),
        }
    }
}

fn parse_target(target: &str) -> Result<Uri, RouteError> {
    target.parse().map_err(|source| RouteError::InvalidTarget {
        target: target.to_string(),
        source,
    })
}

fn listen_path_matches(listen_path: &str, path: &str) -> bool {
    let prefix = listen_path.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Route id to runtime, plus listen-path lookup.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, Arc<RouteRuntime>>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(
        configs: &[RouteConfig],
        discovery: &ServiceDiscoveryConfig,
    ) -> Result<Self, RouteError> {
        let registry = Self::new();
        for config in configs {
            registry.insert(RouteRuntime::new(config.clone(), discovery)?);
        }
        Ok(registry)
    }

    /// Register a route, returning the runtime it replaced.
    pub fn insert(&self, runtime: RouteRuntime) -> Option<Arc<RouteRuntime>> {
        info!(
            api_id = %runtime.id(),
            listen_path = %runtime.config.listen_path,
            "Loaded route"
        );
        self.routes
            .write()
            .insert(runtime.id().to_string(), Arc::new(runtime))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<RouteRuntime>> {
        let removed = self.routes.write().remove(id);
        if removed.is_some() {
            info!(api_id = %id, "Removed route");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<RouteRuntime>> {
        self.routes.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// The route with the longest listen path covering `path`.
    pub fn match_path(&self, path: &str) -> Option<Arc<RouteRuntime>> {
        self.routes
            .read()
            .values()
            .filter(|route| route.matches_path(path))
            .max_by_key(|route| route.config.listen_path.trim_end_matches('/').len())
            .cloned()
    }

    /// Drop expired discovery entries. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        self.routes
            .read()
            .values()
            .filter(|route| route.purge_expired(now))
            .count()
    }

    /// Periodically purge expired discovery entries until `shutdown` fires.
    pub fn spawn_janitor(self: &Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = registry.purge_expired(Instant::now());
                        if purged > 0 {
                            debug!(purged, "Purged expired service discovery entries");
                        }
                    }
                }
            }
        })
    }
}
