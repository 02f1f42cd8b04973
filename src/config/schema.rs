//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// HTTP engine settings (buffers, domains, compression).
    pub http: HttpConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Upstream pool and reverse-proxy behaviour.
    pub proxy: UpstreamConfig,

    /// Primary-side tunnel listener.
    pub tunnel: TunnelConfig,

    /// Satellite-side tunnel client.
    pub satellite: SatelliteConfig,

    /// Statically configured routes.
    pub routes: Vec<RouteConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// HTTP engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Domain used when the request's Host is not registered.
    pub default_domain: String,

    /// Alias domain -> canonical domain.
    pub aliases: HashMap<String, String>,

    /// Fixed per-connection receive buffer capacity in bytes.
    pub receive_buffer_bytes: usize,

    /// Bodies at or above this size are spooled to a temp file.
    pub spool_threshold_bytes: u64,

    /// Content-type prefixes eligible for gzip.
    pub gzip_content_types: Vec<String>,

    /// Value of the `Server` response header.
    pub server_name: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_domain: "localhost".to_string(),
            aliases: HashMap::new(),
            receive_buffer_bytes: 512 * 1024,
            spool_threshold_bytes: 10 * 1024 * 1024,
            gzip_content_types: vec![
                "text/".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
                "application/xml".to_string(),
                "image/svg+xml".to_string(),
            ],
            server_name: "edge-relay".to_string(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Handler deadline (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Idle keep-alive connection timeout in seconds.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            idle_secs: 60,
        }
    }
}

/// Upstream pool and retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Idle pooled connections older than this are evicted.
    pub idle_timeout_secs: u64,

    /// Total attempts per proxied request (2 = one retry).
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Add X-Forwarded-For/Proto/Host to proxied requests.
    pub forwarded_headers: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            max_attempts: 2,
            base_delay_ms: 50,
            max_delay_ms: 1000,
            forwarded_headers: true,
        }
    }
}

/// Primary-side tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Accept satellite connections.
    pub enabled: bool,

    /// Tunnel listener address.
    pub bind_address: String,

    /// Maximum frame payload in bytes.
    pub max_frame_size: usize,

    /// Accepted pre-shared keys.
    pub keys: Vec<TunnelKeyConfig>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0:8443".to_string(),
            max_frame_size: 64 * 1024,
            keys: Vec::new(),
        }
    }
}

/// One accepted tunnel secret.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TunnelKeyConfig {
    /// Shared secret the satellite presents.
    pub secret: String,

    /// Domains this key may register routes for (empty = unrestricted).
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Satellite-side configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SatelliteConfig {
    /// Dial a primary and forward its traffic into the local route table.
    pub enabled: bool,

    /// Primary tunnel address ("host:port").
    pub primary_address: String,

    /// Wrap the tunnel connection in TLS.
    pub tls: bool,

    /// TLS server name (defaults to the host of `primary_address`).
    pub server_name: Option<String>,

    /// Shared secret.
    pub secret: String,

    /// Base reconnect delay in milliseconds.
    pub reconnect_base_ms: u64,

    /// Maximum reconnect delay in milliseconds.
    pub reconnect_max_ms: u64,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            primary_address: String::new(),
            tls: false,
            server_name: None,
            secret: String::new(),
            reconnect_base_ms: 250,
            reconnect_max_ms: 30_000,
        }
    }
}

/// Route configuration mapping a domain + path to a built-in handler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Domain the route belongs to (falls back to `http.default_domain`).
    #[serde(default)]
    pub domain: Option<String>,

    /// Path; a trailing `/*` makes it a wildcard route.
    pub path: String,

    /// What serves the route.
    #[serde(flatten)]
    pub kind: RouteKind,
}

/// Built-in handler kinds available from configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteKind {
    /// Fixed body.
    Static {
        body: String,
        #[serde(default = "default_static_content_type")]
        content_type: String,
    },
    /// Single file.
    File { file: String },
    /// Files below a directory, addressed by the wildcard remainder.
    Directory { directory: String },
    /// Reverse proxy to an upstream base URL.
    Proxy { target: String },
}

fn default_static_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.http.receive_buffer_bytes, 512 * 1024);
        assert_eq!(config.proxy.max_attempts, 2);
        assert!(!config.tunnel.enabled);
    }

    #[test]
    fn routes_deserialize_by_kind() {
        let config: ServerConfig = toml::from_str(
            r#"
            [[routes]]
            domain = "a.com"
            path = "/api/*"
            kind = "proxy"
            target = "http://127.0.0.1:3000/v1"

            [[routes]]
            path = "/hello"
            kind = "static"
            body = "hi"
            "#,
        )
        .unwrap();

        assert_eq!(config.routes.len(), 2);
        assert!(matches!(config.routes[0].kind, RouteKind::Proxy { .. }));
        match &config.routes[1].kind {
            RouteKind::Static { body, content_type } => {
                assert_eq!(body, "hi");
                assert!(content_type.starts_with("text/plain"));
            }
            other => panic!("unexpected route kind {:?}", other),
        }
    }
}
