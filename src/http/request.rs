//! Parsed request model.
//!
//! # Responsibilities
//! - Hold everything the parser extracted for one request
//! - Keep the raw (percent-encoded) target for forwarding alongside the decoded path
//! - Carry connection attributes handlers need (peer address, TLS)
//! - Re-serialize the request head for proxying and tunnelling

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use http::{Method, Version};
use uuid::Uuid;

use crate::http::body::RequestBody;
use crate::http::headers::Headers;

pub const X_REQUEST_ID: &str = "X-Request-Id";

/// Attributes of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    pub tls: bool,
}

impl ConnectionInfo {
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Coarse "private network" check used to decide how much error detail to
    /// show. Not an access-control mechanism.
    pub fn is_private_peer(&self) -> bool {
        match self.peer_addr.ip() {
            IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
            IpAddr::V6(ip) => {
                if let Some(v4) = ip.to_ipv4_mapped() {
                    return v4.is_loopback() || v4.is_private() || v4.is_link_local();
                }
                let first = ip.segments()[0];
                ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
            }
        }
    }
}

/// A byte range of an uploaded file inside the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub field: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub offset: u64,
    pub length: u64,
}

/// One fully received request.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Target exactly as sent (percent-encoded, with query).
    pub raw_target: String,
    /// Decoded path without the query string.
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    /// Host header without port, lowercased.
    pub host: String,
    pub headers: Headers,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub body: RequestBody,
    /// Query and form parameters (first value wins).
    pub params: HashMap<String, String>,
    pub files: Vec<FileUpload>,
    /// Parsed `application/json` body, absent when missing or malformed.
    pub json: Option<serde_json::Value>,
    pub connection: ConnectionInfo,
    pub request_id: Uuid,
}

impl Request {
    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Whether the connection should stay open after this request.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        match self.version {
            Version::HTTP_10 => self.headers.has_token("connection", "keep-alive"),
            _ => true,
        }
    }

    /// Client advertises gzip in Accept-Encoding (ignoring `q=0`).
    pub fn accepts_gzip(&self) -> bool {
        self.headers
            .get_all("accept-encoding")
            .flat_map(|v| v.split(','))
            .any(|item| {
                let mut parts = item.split(';');
                let coding = parts.next().unwrap_or("").trim();
                let disabled = parts.any(|p| {
                    let p = p.trim();
                    p == "q=0" || p == "q=0.0" || p == "q=0.00" || p == "q=0.000"
                });
                coding.eq_ignore_ascii_case("gzip") && !disabled
            })
    }

    pub fn wants_websocket(&self) -> bool {
        self.headers.has_token("connection", "upgrade")
            && self
                .headers
                .get("upgrade")
                .map(|v| v.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    }

    /// Serialize the request line and headers as received.
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.raw_target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}
