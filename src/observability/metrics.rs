//! Metrics collection and exposition.
//!
//! # Metrics
//! - `edge_http_requests_total` (counter): requests by method, status
//! - `edge_http_request_duration_seconds` (histogram): dispatch latency
//! - `edge_active_connections` (gauge): open client connections
//! - `edge_receive_buffer_overflows_total` (counter)
//! - `edge_proxy_pool_checkouts_total` (counter): `result` = hit | miss
//! - `edge_proxy_pool_evictions_total` (counter): by `reason`
//! - `edge_proxy_failures_total` (counter): proxied requests answered 500
//! - `edge_tunnel_sessions` (gauge): authenticated satellite sessions
//! - `edge_tunnel_virtual_clients` (gauge): open virtual clients
//!
//! Without an installed recorder every call is a no-op, so tests and the
//! library never need to set one up.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, elapsed: Duration) {
    counter!(
        "edge_http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("edge_http_request_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_active_connections(active: u64) {
    gauge!("edge_active_connections").set(active as f64);
}

pub fn record_buffer_overflow() {
    counter!("edge_receive_buffer_overflows_total").increment(1);
}

pub fn record_pool_checkout(reused: bool) {
    let result = if reused { "hit" } else { "miss" };
    counter!("edge_proxy_pool_checkouts_total", "result" => result).increment(1);
}

pub fn record_pool_eviction(reason: &'static str) {
    counter!("edge_proxy_pool_evictions_total", "reason" => reason).increment(1);
}

pub fn record_proxy_failure() {
    counter!("edge_proxy_failures_total").increment(1);
}

pub fn record_tunnel_sessions(delta: f64) {
    gauge!("edge_tunnel_sessions").increment(delta);
}

pub fn record_virtual_clients(delta: f64) {
    gauge!("edge_tunnel_virtual_clients").increment(delta);
}
