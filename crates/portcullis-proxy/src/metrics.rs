//! Prometheus metrics for portcullis-proxy.
//!
//! Tracks proxied requests, upstream latency, breaker short-circuits and
//! discovery refreshes.
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder};

lazy_static! {
    /// Total number of requests answered by the proxy
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "portcullis_requests_total",
        "Total number of requests answered by the proxy",
        &["api_id", "status"]
    )
    .unwrap();

    /// Upstream round-trip duration (until response headers)
    pub static ref UPSTREAM_DURATION_MS: HistogramVec = register_histogram_vec!(
        "portcullis_upstream_duration_ms",
        "Duration of upstream round trips in milliseconds",
        &["api_id", "status"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();

    /// Requests rejected by an open circuit breaker
    pub static ref BREAKER_SHORT_CIRCUITS_TOTAL: CounterVec = register_counter_vec!(
        "portcullis_breaker_short_circuits_total",
        "Requests short-circuited by an open circuit breaker",
        &["api_id"]
    )
    .unwrap();

    /// Service discovery refreshes
    pub static ref DISCOVERY_REFRESHES_TOTAL: CounterVec = register_counter_vec!(
        "portcullis_discovery_refreshes_total",
        "Service discovery refreshes by outcome",
        &["api_id", "result"]  // result: ok|empty|error
    )
    .unwrap();

    /// Proxy failures by kind
    pub static ref PROXY_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "portcullis_proxy_errors_total",
        "Proxy failures by kind",
        &["api_id", "kind"]  // kind: timeout|host_lookup|upstream|routing|breaker_open|internal
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(api_id: &str, status: u16) {
    REQUESTS_TOTAL
        .with_label_values(&[api_id, &status.to_string()])
        .inc();
}

pub fn record_upstream_duration(api_id: &str, status: u16, duration_ms: f64) {
    UPSTREAM_DURATION_MS
        .with_label_values(&[api_id, &status.to_string()])
        .observe(duration_ms);
}

pub fn record_short_circuit(api_id: &str) {
    BREAKER_SHORT_CIRCUITS_TOTAL
        .with_label_values(&[api_id])
        .inc();
}

pub fn record_discovery_refresh(api_id: &str, result: &str) {
    DISCOVERY_REFRESHES_TOTAL
        .with_label_values(&[api_id, result])
        .inc();
}

pub fn record_proxy_error(api_id: &str, kind: &str) {
    PROXY_ERRORS_TOTAL.with_label_values(&[api_id, kind]).inc();
}
