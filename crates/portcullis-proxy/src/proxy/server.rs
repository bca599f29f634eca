//! ProxyServer struct and main run loop.
//!
//! The server owns the route registry and the shared `ReverseProxy`. Each
//! accepted connection is served on its own task; requests are matched to a
//! route by listen path and handed to the proxy.

use super::errors::error_response;
use super::handler::ReverseProxy;
use super::ClientBody;
use crate::config::Config;
use crate::metrics::collect_metrics;
use crate::route::RouteRegistry;
use crate::session::ClientAddr;
use anyhow::Context;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ProxyServer {
    config: Arc<Config>,
    routes: Arc<RouteRegistry>,
    proxy: Arc<ReverseProxy>,
}

impl ProxyServer {
    /// Build a server whose proxy has no discovery backend and treats every
    /// host as up.
    pub fn new(config: Config) -> Result<Self, anyhow::Error> {
        let proxy = ReverseProxy::new(config.proxy.clone(), &config.connection_pool);
        Self::with_proxy(config, proxy)
    }

    /// Build a server around an already configured proxy.
    pub fn with_proxy(config: Config, proxy: ReverseProxy) -> Result<Self, anyhow::Error> {
        let routes = RouteRegistry::from_configs(&config.routes, &config.service_discovery)
            .context("Failed to load routes")?;
        Ok(Self {
            config: Arc::new(config),
            routes: Arc::new(routes),
            proxy: Arc::new(proxy),
        })
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    /// Bind the configured listeners and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let addr: SocketAddr = format!("{}:{}", self.config.listen.address, self.config.listen.port)
            .parse()
            .context("Invalid listen address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        info!("Listening on http://{}", addr);
        info!("Loaded {} routes", self.routes.len());

        let janitor = self.routes.spawn_janitor(
            Duration::from_secs(self.config.service_discovery.cleanup_interval_secs),
            shutdown.clone(),
        );

        if self.config.metrics.enabled {
            let metrics_addr = SocketAddr::new(addr.ip(), self.config.metrics.port);
            let metrics_listener = TcpListener::bind(metrics_addr)
                .await
                .with_context(|| format!("Failed to bind metrics listener {metrics_addr}"))?;
            info!("Metrics available on http://{}/metrics", metrics_addr);
            tokio::spawn(serve_metrics(metrics_listener, shutdown.clone()));
        }

        let result = self.serve(listener, shutdown).await;
        if let Err(e) = janitor.await {
            warn!("Discovery cache janitor ended abnormally: {}", e);
        }
        result
    }

    /// Accept connections on `listener` until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down proxy listener");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle(req, remote_addr).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }

    async fn handle(&self, mut req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ClientBody> {
        req.extensions_mut().insert(ClientAddr(remote_addr));
        let close = self.config.proxy.close_connections;

        let Some(route) = self.routes.match_path(req.uri().path()) else {
            debug!("No route for {} {}", req.method(), req.uri().path());
            return error_response(StatusCode::NOT_FOUND, "Not found", close);
        };

        let path = route.upstream_path(req.uri().path()).into_owned();
        if path != req.uri().path() {
            if let Err(e) = rewrite_path(&mut req, &path) {
                error!(api_id = %route.id(), "Failed to strip listen path: {}", e);
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "There was a problem proxying the request",
                    close,
                );
            }
        }

        self.proxy.serve(&route, req).await
    }
}

fn rewrite_path<B>(req: &mut Request<B>, path: &str) -> Result<(), hyper::http::Error> {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse()?);
    *req.uri_mut() = Uri::from_parts(parts)?;
    Ok(())
}

async fn serve_metrics(listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Metrics listener failed: {}", e);
                    return;
                }
            },
        };

        tokio::spawn(async move {
            let service = service_fn(|req: Request<Incoming>| async move {
                Ok::<_, Infallible>(metrics_response(&req))
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Metrics connection error: {}", e);
            }
        });
    }
}

fn metrics_response<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from_static(b"Not found")));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    let mut response = Response::new(Full::new(Bytes::from(collect_metrics())));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
