//! Response middleware hook.
//!
//! The proxy runs a route's response chain after the upstream answered and
//! before the body is relayed. Chain failures are logged and never turn into
//! client errors.

use async_trait::async_trait;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::response;
use hyper::{Method, Uri};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("response handler '{name}' failed: {reason}")]
    Handler { name: String, reason: String },
    #[error("invalid response header '{0}'")]
    InvalidHeader(String),
}

/// What the chain may inspect of the inbound request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_addr: Option<SocketAddr>,
}

#[async_trait]
pub trait ResponseChain: Send + Sync {
    async fn run(
        &self,
        res: &mut response::Parts,
        req: &RequestInfo,
        session: &Session,
    ) -> Result<(), ChainError>;
}

/// Sets a fixed group of headers on every response.
#[derive(Debug, Clone)]
pub struct HeaderInjector {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderInjector {
    pub fn new(headers: &BTreeMap<String, String>) -> Result<Self, ChainError> {
        let headers = headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ChainError::InvalidHeader(name.clone()))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| ChainError::InvalidHeader(name.to_string()))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, ChainError>>()?;
        Ok(Self { headers })
    }
}

#[async_trait]
impl ResponseChain for HeaderInjector {
    async fn run(
        &self,
        res: &mut response::Parts,
        _req: &RequestInfo,
        _session: &Session,
    ) -> Result<(), ChainError> {
        for (name, value) in &self.headers {
            res.headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}
