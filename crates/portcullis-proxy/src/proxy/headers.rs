//! Header names and hop-by-hop handling shared by the request and response
//! sides of the proxy.
//!
//! Header names are `from_static` so call sites never parse at runtime.

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::response::Parts;
use hyper::Response;

pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub static VALUE_CLOSE: HeaderValue = HeaderValue::from_static("close");

/// Headers that only apply to a single connection leg.
pub static HOP_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove every header named in the `Connection` header's token list.
pub fn strip_connection_listed(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .filter_map(|f| HeaderName::from_bytes(f.as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
}

pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS.iter() {
        headers.remove(name);
    }
}

/// A WebSocket handshake: `Connection` lists `upgrade` and `Upgrade` is
/// `websocket`, both case-insensitive.
pub fn is_websocket(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade
        && headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// Extension trait for setting headers on responses.
pub trait PortcullisHeadersExt {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue);

    /// Returns false if `value` is not a valid header value.
    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool;
}

impl PortcullisHeadersExt for HeaderMap {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.insert(name.clone(), value.clone());
    }

    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                self.insert(name.clone(), header_value);
                true
            }
            Err(_) => false,
        }
    }
}

impl<B> PortcullisHeadersExt for Response<B> {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers_mut().set_header(name, value);
    }

    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        self.headers_mut().set_header_value(name, value)
    }
}

impl PortcullisHeadersExt for Parts {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers.set_header(name, value);
    }

    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        self.headers.set_header_value(name, value)
    }
}
