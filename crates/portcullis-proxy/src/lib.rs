// Portcullis: the forwarding core of an API gateway.

pub mod circuit_breaker;
pub mod config;
pub mod discovery;
pub mod host_list;
pub mod liveness;
pub mod load_balancer;
pub mod metrics;
pub mod path_table;
pub mod proxy;
pub mod route;
pub mod session;

pub use config::Config;
pub use proxy::{ProxyServer, ReverseProxy};
