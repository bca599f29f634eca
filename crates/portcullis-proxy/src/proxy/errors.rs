//! Client-visible error responses and structured error logging.
//!
//! Every upstream-facing failure becomes a fixed message and status code;
//! upstream error text never reaches the client.

use super::headers::{PortcullisHeadersExt, VALUE_CLOSE};
use super::transport::TransportError;
use super::ClientBody;
use crate::metrics;
use crate::route::RouteError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use std::error::Error as _;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Upstream service reached hard timeout.")]
    HardTimeout,
    #[error("Upstream host lookup failed")]
    HostLookup(#[source] TransportError),
    #[error("There was a problem proxying the request")]
    Upstream(#[source] TransportError),
    #[error("Service temporarily unavailable.")]
    BreakerOpen,
    #[error("There was a problem proxying the request")]
    Routing(#[source] RouteError),
    #[error("There was a problem proxying the request")]
    Internal(String),
}

impl From<TransportError> for ProxyError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::HeaderTimeout => Self::HardTimeout,
            e @ TransportError::HostLookup(_) => Self::HostLookup(e),
            e => Self::Upstream(e),
        }
    }
}

impl From<RouteError> for ProxyError {
    fn from(err: RouteError) -> Self {
        Self::Routing(err)
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::HardTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::HostLookup(_) | Self::Upstream(_) | Self::Routing(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HardTimeout => "timeout",
            Self::HostLookup(_) => "host_lookup",
            Self::Upstream(_) => "upstream",
            Self::BreakerOpen => "breaker_open",
            Self::Routing(_) => "routing",
            Self::Internal(_) => "internal",
        }
    }

    /// The underlying cause, for logs only.
    pub fn detail(&self) -> String {
        match self {
            Self::HardTimeout => TransportError::HeaderTimeout.to_string(),
            Self::Internal(msg) => msg.clone(),
            other => {
                let mut detail = String::new();
                let mut source = other.source();
                while let Some(e) = source {
                    if !detail.is_empty() {
                        detail.push_str(": ");
                    }
                    detail.push_str(&e.to_string());
                    source = e.source();
                }
                detail
            }
        }
    }
}

/// Structured fields attached to proxy error logs.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub api_id: String,
    pub org_id: String,
    pub user_ip: String,
    pub server_name: String,
    /// Redacted auth token.
    pub user_id: String,
    /// Session alias.
    pub user_name: String,
}

/// Build a JSON error response: `{"error": "<message>"}`.
pub fn error_response(status: StatusCode, message: &str, close_connections: bool) -> Response<ClientBody> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if close_connections {
        response.set_header(&header::CONNECTION, &VALUE_CLOSE);
    }
    response
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorReporter {
    close_connections: bool,
}

impl ErrorReporter {
    pub fn new(close_connections: bool) -> Self {
        Self { close_connections }
    }

    /// Log `err` with the request's context and build the client response.
    pub fn report(&self, err: &ProxyError, ctx: &LogContext) -> Response<ClientBody> {
        match err {
            ProxyError::BreakerOpen => {
                debug!(api_id = %ctx.api_id, "Circuit breaker open, request short-circuited");
            }
            ProxyError::Routing(_) => {
                warn!(
                    api_id = %ctx.api_id,
                    org_id = %ctx.org_id,
                    user_ip = %ctx.user_ip,
                    "Failed to resolve upstream target: {}",
                    err.detail()
                );
            }
            _ => {
                error!(
                    api_id = %ctx.api_id,
                    org_id = %ctx.org_id,
                    user_ip = %ctx.user_ip,
                    server_name = %ctx.server_name,
                    user_id = %ctx.user_id,
                    user_name = %ctx.user_name,
                    "http: proxy error: {}",
                    err.detail()
                );
            }
        }
        metrics::record_proxy_error(&ctx.api_id, err.kind());
        metrics::record_request(&ctx.api_id, err.status().as_u16());
        error_response(err.status(), &err.to_string(), self.close_connections)
    }
}
