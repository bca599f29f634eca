//! Transport selection and the upstream round trip.
//!
//! Three kinds of transport exist: the shared standard client, per-timeout
//! clients for routes with a hard timeout, and a non-pooling client for
//! WebSocket upgrades.

use super::client::{create_http_client, ClientSettings, HttpClient, ProxyBody};
use crate::config::ConnectionPoolConfig;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response};
use hyper_util::client::legacy;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("timeout awaiting response headers")]
    HeaderTimeout,
    #[error("upstream host lookup failed: {0}")]
    HostLookup(#[source] legacy::Error),
    #[error("upstream request canceled")]
    Canceled,
    #[error("upstream request failed: {0}")]
    Client(#[source] legacy::Error),
    #[error("upstream request task failed: {0}")]
    Request(#[from] tokio::task::JoinError),
}

impl TransportError {
    fn from_client(err: legacy::Error) -> Self {
        if is_host_lookup(&err) {
            Self::HostLookup(err)
        } else {
            Self::Client(err)
        }
    }
}

fn is_host_lookup(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let msg = e.to_string();
        if msg.contains("dns error")
            || msg.contains("failed to lookup address")
            || msg.contains("no such host")
        {
            return true;
        }
        current = e.source();
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Standard,
    Timed(Duration),
    WebSocket,
}

pub struct Transports {
    settings: ClientSettings,
    standard: HttpClient,
    websocket: HttpClient,
    timed: Mutex<HashMap<Duration, HttpClient>>,
}

impl Transports {
    pub fn new(pool: &ConnectionPoolConfig, skip_tls_verify: bool) -> Self {
        let settings = ClientSettings::from_pool(pool, skip_tls_verify);
        let standard = create_http_client(&settings);
        let websocket = create_http_client(&ClientSettings {
            max_idle_per_host: 0,
            ..settings.clone()
        });
        Self {
            settings,
            standard,
            websocket,
            timed: Mutex::new(HashMap::new()),
        }
    }

    /// Pick the transport for one request.
    pub fn select(&self, timeout: Option<Duration>, websocket: bool) -> Transport {
        if websocket {
            return Transport {
                client: self.websocket.clone(),
                kind: TransportKind::WebSocket,
                header_timeout: timeout,
            };
        }

        match timeout {
            None => Transport {
                client: self.standard.clone(),
                kind: TransportKind::Standard,
                header_timeout: None,
            },
            Some(limit) => {
                let client = self
                    .timed
                    .lock()
                    .entry(limit)
                    .or_insert_with(|| {
                        debug!("Setting timeout for outbound requests to {:?}", limit);
                        create_http_client(&ClientSettings {
                            connect_timeout: limit,
                            ..self.settings.clone()
                        })
                    })
                    .clone();
                Transport {
                    client,
                    kind: TransportKind::Timed(limit),
                    header_timeout: Some(limit),
                }
            }
        }
    }
}

pub struct Transport {
    client: HttpClient,
    kind: TransportKind,
    header_timeout: Option<Duration>,
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Send `req` and wait for the response headers.
    ///
    /// The call runs on its own task and is abandoned as soon as `cancel`
    /// fires, which the caller ties to the client connection's lifetime.
    pub async fn round_trip(
        &self,
        req: Request<ProxyBody>,
        cancel: CancellationToken,
    ) -> Result<Response<Incoming>, TransportError> {
        let client = self.client.clone();
        let header_timeout = self.header_timeout;

        let call = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Canceled),
                res = send(client, req, header_timeout) => res,
            }
        });
        call.await?
    }
}

async fn send(
    client: HttpClient,
    req: Request<ProxyBody>,
    header_timeout: Option<Duration>,
) -> Result<Response<Incoming>, TransportError> {
    let pending = client.request(req);
    match header_timeout {
        Some(limit) => tokio::time::timeout(limit, pending)
            .await
            .map_err(|_| TransportError::HeaderTimeout)?
            .map_err(TransportError::from_client),
        None => pending.await.map_err(TransportError::from_client),
    }
}

/// Splice the client and upstream connections once both sides have switched
/// protocols.
pub fn spawn_upgrade_tunnel(client: OnUpgrade, upstream: OnUpgrade, api_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(api_id = %api_id, "WebSocket upgrade failed: {}", e);
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                debug!(api_id = %api_id, sent, received, "WebSocket tunnel closed");
            }
            Err(e) => debug!(api_id = %api_id, "WebSocket tunnel error: {}", e),
        }
    })
}
