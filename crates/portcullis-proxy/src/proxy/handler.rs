//! Per-request orchestration.
//!
//! `ReverseProxy` sequences one forwarded call: target resolution, request
//! construction, the circuit-breaker gate, the round trip and response
//! processing. Every step runs strictly in that order for a single request.

use super::chain::RequestInfo;
use super::client::{BoxError, ProxyBody};
use super::director::{direct, DirectorSettings};
use super::errors::{error_response, ErrorReporter, LogContext, ProxyError};
use super::headers::is_websocket;
use super::streamer::{body_reader, capture, CapturedResponse, ResponseStreamer};
use super::transport::{spawn_upgrade_tunnel, TransportError, Transports};
use super::ClientBody;
use crate::config::{ConnectionPoolConfig, ProxyOptions};
use crate::discovery::{NoDiscovery, ServiceDiscovery};
use crate::liveness::{HostChecker, NeverDown};
use crate::metrics;
use crate::route::RouteRuntime;
use crate::session::{AuthToken, ClientAddr, RetainHost, Session};
use futures::FutureExt;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// The forwarding engine shared by every route.
pub struct ReverseProxy {
    options: ProxyOptions,
    user_agent: HeaderValue,
    transports: Transports,
    discovery: Arc<dyn ServiceDiscovery>,
    host_checker: Arc<dyn HostChecker>,
    reporter: ErrorReporter,
    streamer: ResponseStreamer,
}

impl ReverseProxy {
    pub fn new(options: ProxyOptions, pool: &ConnectionPoolConfig) -> Self {
        let user_agent = HeaderValue::from_str(&options.user_agent).unwrap_or_else(|_| {
            debug!("Configured user agent is not a valid header value, using default");
            HeaderValue::from_static(concat!("portcullis/", env!("CARGO_PKG_VERSION")))
        });
        let flush_interval =
            (options.flush_interval_ms > 0).then(|| Duration::from_millis(options.flush_interval_ms));

        Self {
            transports: Transports::new(pool, options.ssl_insecure_skip_verify),
            discovery: Arc::new(NoDiscovery),
            host_checker: Arc::new(NeverDown),
            reporter: ErrorReporter::new(options.close_connections),
            streamer: ResponseStreamer::new(flush_interval, options.close_connections),
            user_agent,
            options,
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_host_checker(mut self, checker: Arc<dyn HostChecker>) -> Self {
        self.host_checker = checker;
        self
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Forward `req` to the route's backend and stream the answer back.
    pub async fn serve<B>(&self, route: &RouteRuntime, req: Request<B>) -> Response<ClientBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        self.guarded(route, req, false).await.0
    }

    /// Like `serve`, but the body is buffered first and also returned to the
    /// caller. The backend connection is released before the client body
    /// starts streaming.
    pub async fn serve_for_cache<B>(
        &self,
        route: &RouteRuntime,
        req: Request<B>,
    ) -> (Response<ClientBody>, Option<CapturedResponse>)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        self.guarded(route, req, true).await
    }

    async fn guarded<B>(
        &self,
        route: &RouteRuntime,
        req: Request<B>,
        cache_mode: bool,
    ) -> (Response<ClientBody>, Option<CapturedResponse>)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match AssertUnwindSafe(self.forward(route, req, cache_mode))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(api_id = %route.id(), "http: proxy error: request handler panicked");
                metrics::record_proxy_error(route.id(), "panic");
                metrics::record_request(route.id(), StatusCode::INTERNAL_SERVER_ERROR.as_u16());
                let err = ProxyError::Internal("request handler panicked".to_string());
                (
                    error_response(err.status(), &err.to_string(), self.options.close_connections),
                    None,
                )
            }
        }
    }

    async fn forward<B>(
        &self,
        route: &RouteRuntime,
        mut req: Request<B>,
        cache_mode: bool,
    ) -> (Response<ClientBody>, Option<CapturedResponse>)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let api_id = route.id().to_string();
        let client_addr = req.extensions().get::<ClientAddr>().map(|addr| addr.0);
        let session = req.extensions().get::<Session>().cloned();
        let retain_host =
            route.config().url_rewrite_enabled && req.extensions().get::<RetainHost>().is_some();

        let mut ctx = LogContext {
            api_id: api_id.clone(),
            org_id: route.org_id().to_string(),
            user_ip: client_addr.map(|addr| addr.ip().to_string()).unwrap_or_default(),
            server_name: String::new(),
            user_id: req
                .extensions()
                .get::<AuthToken>()
                .map(AuthToken::redacted)
                .unwrap_or_default(),
            user_name: session.as_ref().map(|s| s.alias.clone()).unwrap_or_default(),
        };

        let timeout = route.effective_timeout(
            req.method(),
            req.uri().path(),
            self.options.default_timeout_secs,
        );
        let websocket = self.options.enable_websockets && is_websocket(req.headers());

        let target = match route
            .resolve_target(&*self.discovery, &*self.host_checker)
            .await
        {
            Ok(target) => target,
            Err(e) => return (self.reporter.report(&ProxyError::from(e), &ctx), None),
        };

        let info = RequestInfo {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
            client_addr,
        };
        let client_upgrade = websocket.then(|| hyper::upgrade::on(&mut req));

        let settings = DirectorSettings {
            preserve_host: route.config().preserve_host_header,
            user_agent: self.user_agent.clone(),
            websocket,
            retain_host,
            client_addr,
        };
        if let Err(e) = direct(&mut req, &target, &settings) {
            return (
                self.reporter.report(&ProxyError::Internal(e.to_string()), &ctx),
                None,
            );
        }
        ctx.server_name = req.uri().host().unwrap_or_default().to_string();

        let (parts, body) = req.into_parts();
        let body = outbound_body(&parts.headers, body);
        let outbound = Request::from_parts(parts, body);

        // Held across the round trip; dropping it unsettled frees a half-open probe slot.
        let permit = match route.breaker_for(&info.method, info.uri.path()) {
            Some(breaker) => match breaker.acquire() {
                Some(permit) => Some(permit),
                None => {
                    metrics::record_short_circuit(&api_id);
                    return (self.reporter.report(&ProxyError::BreakerOpen, &ctx), None);
                }
            },
            None => None,
        };

        let transport = self.transports.select(timeout, websocket);
        debug!(api_id = %api_id, "Forwarding via {:?} transport", transport.kind());

        // Dropping this future (client gone) cancels the backend call.
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let started = Instant::now();
        let result = transport.round_trip(outbound, cancel).await;

        if let Some(permit) = permit {
            match &result {
                Err(TransportError::Canceled) => drop(permit),
                Err(_) => permit.fail(),
                Ok(res) if res.status() == StatusCode::INTERNAL_SERVER_ERROR => permit.fail(),
                Ok(_) => permit.success(),
            }
        }

        let mut res = match result {
            Ok(res) => res,
            Err(TransportError::Canceled) => {
                debug!(api_id = %api_id, "Client went away, upstream call canceled");
                let err = ProxyError::Upstream(TransportError::Canceled);
                metrics::record_request(&api_id, err.status().as_u16());
                return (
                    error_response(err.status(), &err.to_string(), self.options.close_connections),
                    None,
                );
            }
            Err(e) => {
                let err = ProxyError::from(e);
                if matches!(err, ProxyError::HardTimeout) {
                    route.invalidate_discovery();
                }
                return (self.reporter.report(&err, &ctx), None);
            }
        };

        let status = res.status();
        metrics::record_upstream_duration(
            &api_id,
            status.as_u16(),
            started.elapsed().as_secs_f64() * 1000.0,
        );

        if status == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut res);
                spawn_upgrade_tunnel(client_upgrade, upstream_upgrade, api_id.clone());
                metrics::record_request(&api_id, status.as_u16());
                let (parts, _) = res.into_parts();
                let empty = Empty::new().map_err(|never| match never {}).boxed();
                return (Response::from_parts(parts, empty), None);
            }
        }

        let (mut parts, body) = res.into_parts();
        let mut captured = None;
        let source: Box<dyn AsyncRead + Send + Unpin> = if cache_mode {
            let bytes = capture(&mut body_reader(body), &ctx).await;
            let snapshot = CapturedResponse::new(&parts, bytes);
            let reader = snapshot.reader();
            captured = Some(snapshot);
            Box::new(reader)
        } else {
            Box::new(body_reader(body))
        };

        if let Some(chain) = route.response_chain() {
            let session = session.clone().unwrap_or_default();
            if let Err(e) = chain.run(&mut parts, &info, &session).await {
                error!(api_id = %api_id, org_id = %ctx.org_id, "Response chain failed: {}", e);
            }
        }

        self.streamer.prepare_headers(&mut parts, session.as_ref());
        let body = self.streamer.relay(source, ctx);
        metrics::record_request(&api_id, status.as_u16());

        (Response::from_parts(parts, body), captured)
    }
}

/// A body known to be empty is sent as an explicit empty body so the client
/// may safely retry the request on a stale pooled connection.
fn outbound_body<B>(headers: &HeaderMap, body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let declared_empty = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");

    if declared_empty || body.is_end_stream() {
        Empty::new().map_err(|never| match never {}).boxed_unsync()
    } else {
        body.map_err(Into::<BoxError>::into).boxed_unsync()
    }
}
