//! Builds the outbound request from the inbound one.

use super::headers::{strip_connection_listed, strip_hop_headers, PortcullisHeadersExt, X_FORWARDED_FOR};
use crate::session::forwarded_for;
use hyper::header::{self, HeaderValue};
use hyper::http::uri::{Authority, PathAndQuery};
use hyper::{Request, Uri, Version};
use std::borrow::Cow;
use std::net::SocketAddr;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error("upstream target '{0}' has no scheme or host")]
    RelativeTarget(Uri),
    #[error("cannot build upstream URL: {0}")]
    Uri(#[from] hyper::http::Error),
}

/// Per-request inputs to the director.
#[derive(Debug, Clone)]
pub struct DirectorSettings {
    pub preserve_host: bool,
    pub user_agent: HeaderValue,
    /// Hop-by-hop headers are left alone for upgrade handshakes.
    pub websocket: bool,
    /// The inbound URI was already rewritten and must be used as is.
    pub retain_host: bool,
    pub client_addr: Option<SocketAddr>,
}

/// Collapse a doubled leading or trailing slash into one.
pub fn clean_slashes(a: &str) -> Cow<'_, str> {
    let start = a.starts_with("//");
    let end = a.ends_with("//");
    if !start && !end {
        return Cow::Borrowed(a);
    }

    let mut s = a;
    if start {
        s = &s[1..];
    }
    if end && s.len() >= 2 {
        s = &s[..s.len() - 1];
    }
    Cow::Owned(s.to_string())
}

/// Join two path segments with exactly one slash between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a = clean_slashes(a);
    let b = clean_slashes(b);
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');

    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) if !b.is_empty() => format!("{a}/{b}"),
        (false, false) => a.into_owned(),
        _ => format!("{a}{b}"),
    }
}

fn merge_query(target: &str, inbound: &str) -> String {
    if target.is_empty() || inbound.is_empty() {
        format!("{target}{inbound}")
    } else {
        format!("{target}&{inbound}")
    }
}

/// Rewrite `req` in place so it is ready to send to `target`.
pub fn direct<B>(req: &mut Request<B>, target: &Uri, settings: &DirectorSettings) -> Result<(), DirectorError> {
    // Connection-scoped headers go first so nothing added below is removed.
    if !settings.websocket {
        strip_connection_listed(req.headers_mut());
        strip_hop_headers(req.headers_mut());
    }

    let inbound_query = req.uri().query().unwrap_or("").to_string();
    let target_query = target.query().unwrap_or("");

    let rewritten = settings.retain_host && req.uri().authority().is_some();
    let (scheme, authority, path) = if rewritten {
        debug!("Detected host rewrite, overriding target");
        let uri = req.uri();
        (
            uri.scheme().cloned().unwrap_or(hyper::http::uri::Scheme::HTTP),
            uri.authority().cloned(),
            uri.path().to_string(),
        )
    } else {
        let (Some(scheme), Some(authority)) = (target.scheme(), target.authority()) else {
            return Err(DirectorError::RelativeTarget(target.clone()));
        };
        (
            scheme.clone(),
            Some(authority.clone()),
            single_joining_slash(target.path(), req.uri().path()),
        )
    };
    let authority: Option<Authority> = authority;

    let query = merge_query(target_query, &inbound_query);
    let path = if path.is_empty() { "/".to_string() } else { path };
    let path_and_query: PathAndQuery = if query.is_empty() {
        path.parse().map_err(hyper::http::Error::from)?
    } else {
        format!("{path}?{query}")
            .parse()
            .map_err(hyper::http::Error::from)?
    };

    let mut builder = Uri::builder().scheme(scheme).path_and_query(path_and_query);
    if let Some(authority) = &authority {
        builder = builder.authority(authority.clone());
    }
    *req.uri_mut() = builder.build()?;
    *req.version_mut() = Version::HTTP_11;

    if !settings.preserve_host {
        if let Some(authority) = &authority {
            req.headers_mut()
                .set_header_value(&header::HOST, authority.as_str());
        }
    }

    if !req.headers().contains_key(header::USER_AGENT) {
        req.headers_mut()
            .set_header(&header::USER_AGENT, &settings.user_agent);
    }

    if let Some(chain) = forwarded_for(req.headers(), settings.client_addr) {
        req.headers_mut().set_header_value(&X_FORWARDED_FOR, &chain);
    }

    debug!("Outbound request: {} {}", req.method(), req.uri());
    Ok(())
}
