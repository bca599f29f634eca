//! Upstream HTTP client construction.

use super::tls::SkipChainVerification;
use crate::config::ConnectionPoolConfig;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of requests sent upstream.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>;

/// Knobs for one upstream client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub idle_timeout: Duration,
    /// 0 disables connection reuse.
    pub max_idle_per_host: usize,
    pub skip_tls_verify: bool,
}

impl ClientSettings {
    pub fn from_pool(pool: &ConnectionPoolConfig, skip_tls_verify: bool) -> Self {
        Self {
            connect_timeout: Duration::from_secs(pool.connect_timeout_secs),
            keepalive: Duration::from_secs(pool.keepalive_timeout_secs),
            idle_timeout: Duration::from_secs(pool.idle_timeout_secs),
            max_idle_per_host: pool.max_idle_per_host,
            skip_tls_verify,
        }
    }
}

/// Create an HTTP/1.1 client speaking both http and https upstreams.
pub fn create_http_client(settings: &ClientSettings) -> HttpClient {
    // Another component may have installed a provider already.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut http_connector = HttpConnector::new();
    http_connector.set_keepalive(Some(settings.keepalive));
    http_connector.set_connect_timeout(Some(settings.connect_timeout));
    http_connector.enforce_http(false);

    let https_connector = if settings.skip_tls_verify {
        warn!("Upstream TLS certificate verification is DISABLED");
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(SkipChainVerification::new()))
                    .with_no_client_auth(),
            )
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector)
    } else {
        match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder.https_or_http().enable_http1().wrap_connector(http_connector),
            Err(e) => {
                // Plain http upstreams keep working; https ones will fail verification.
                warn!("Failed to load native root certificates: {}", e);
                hyper_rustls::HttpsConnectorBuilder::new()
                    .with_tls_config(
                        rustls::ClientConfig::builder()
                            .with_root_certificates(rustls::RootCertStore::empty())
                            .with_no_client_auth(),
                    )
                    .https_or_http()
                    .enable_http1()
                    .wrap_connector(http_connector)
            }
        }
    };

    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(settings.idle_timeout)
        .pool_max_idle_per_host(settings.max_idle_per_host)
        .build(https_connector);

    debug!(
        "Upstream client configured: max_idle={}, idle_timeout={:?}, connect_timeout={:?}",
        settings.max_idle_per_host, settings.idle_timeout, settings.connect_timeout
    );

    client
}
