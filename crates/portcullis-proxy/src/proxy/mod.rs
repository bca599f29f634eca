//! Reverse proxy engine.
//!
//! # Module Structure
//!
//! - `server` - listener, route matching and the metrics endpoint
//! - `handler` - `ReverseProxy`, which sequences one forwarded request
//! - `director` - outbound request construction
//! - `transport` - transport selection and the upstream round trip
//! - `streamer` - response header processing and body relay
//! - `errors` - client-visible error responses and error logging
//! - `chain` - response chain run before the body is relayed
//! - `client` - HTTP client creation and configuration
//! - `tls` - upstream certificate verification overrides

pub mod chain;
mod client;
pub mod director;
pub mod errors;
mod handler;
pub mod headers;
mod server;
pub mod streamer;
mod tls;
pub mod transport;

#[cfg(test)]
mod tests;

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;

/// Body of responses written to the client.
pub type ClientBody = BoxBody<Bytes, std::io::Error>;

pub use chain::{ChainError, HeaderInjector, RequestInfo, ResponseChain};
pub use client::{BoxError, ProxyBody};
pub use errors::{error_response, ProxyError};
pub use handler::ReverseProxy;
pub use server::ProxyServer;
pub use streamer::CapturedResponse;
