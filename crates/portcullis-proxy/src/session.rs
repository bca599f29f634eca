//! Request extensions attached by upstream middleware.
//!
//! Authentication, URL rewriting and the listener put these into
//! `Request::extensions()`; the proxy only reads them.

use hyper::header::HeaderMap;
use std::net::SocketAddr;

use crate::proxy::headers::X_FORWARDED_FOR;

/// Authenticated session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub alias: String,
    pub quota_max: i64,
    pub quota_remaining: i64,
    /// Unix timestamp at which the quota renews.
    pub quota_renews: i64,
}

/// Credential the request was authorized with. Only ever logged redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(pub String);

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AuthToken").field(&self.redacted()).finish()
    }
}

impl AuthToken {
    /// `****` followed by the last four characters; empty for short tokens.
    pub fn redacted(&self) -> String {
        redact_token(&self.0)
    }
}

pub fn redact_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() > 4 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{tail}")
    } else {
        String::new()
    }
}

/// Set by the URL rewriter when the request URI is already final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainHost;

/// Peer address of the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Value for `X-Forwarded-For`: any prior chain followed by the client IP.
pub fn forwarded_for(headers: &HeaderMap, client: Option<SocketAddr>) -> Option<String> {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    match (prior.is_empty(), client) {
        (true, None) => None,
        (true, Some(addr)) => Some(addr.ip().to_string()),
        (false, None) => Some(prior.join(", ")),
        (false, Some(addr)) => Some(format!("{}, {}", prior.join(", "), addr.ip())),
    }
}
