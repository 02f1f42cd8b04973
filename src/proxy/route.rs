//! Reverse-proxy route.
//!
//! # Responsibilities
//! - Rewrite the request line: matched route prefix replaced by the target's
//!   base path
//! - Forward the original headers minus hop-by-hop ones, with `Host`
//!   replaced and `X-Forwarded-*` / `X-Request-Id` added
//! - Stream the request body upstream
//! - Relay the upstream response verbatim, or buffer it for an interceptor
//!   that rewrites the body
//! - Retry transport failures on a fresh connection while the client has
//!   seen nothing; answer `500 Proxy error` once attempts run out
//!
//! # Data Flow
//! ```text
//! Request ─▶ build head ─▶ pool.checkout ─▶ write head + body ─▶ UpstreamReader
//!                                                                   │
//!            ┌──────────── interceptor matches? ────────────────────┤
//!            ▼ yes                                                  ▼ no
//!     buffer + rewrite ─▶ Response (new Content-Length)     raw head + parts ─▶ Downstream
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::{Error, Result};
use crate::http::headers::Headers;
use crate::http::request::{Request, X_REQUEST_ID};
use crate::http::response::Response;
use crate::observability::metrics;
use crate::proxy::pool::{ConnectionPool, PoolKey};
use crate::proxy::reader::{Framing, ResponseHead, UpstreamError, UpstreamReader};
use crate::resilience::retries::RetryPolicy;
use crate::routing::handler::{Handler, RequestContext};

/// Characters escaped when re-encoding a decoded path.
const PATH_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%');

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "upgrade",
    "te",
    "trailer",
    "transfer-encoding",
];

pub type InterceptPredicate = dyn Fn(&Request, &ResponseHead) -> bool + Send + Sync;
pub type RewriteBody = dyn Fn(&Request, &ResponseHead, Bytes) -> Bytes + Send + Sync;

/// Buffers matching upstream responses so their body can be rewritten.
#[derive(Clone)]
pub struct Interceptor {
    pub matches: Arc<InterceptPredicate>,
    pub rewrite: Arc<RewriteBody>,
}

enum AttemptError {
    /// Nothing reached the client; another attempt is possible.
    Transport(String),
    /// Bytes already went downstream.
    Downstream(String),
}

pub struct ProxyRoute {
    target: Url,
    key: PoolKey,
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    forwarded_headers: bool,
    interceptor: Option<Interceptor>,
}

impl ProxyRoute {
    pub fn new(target: Url, pool: Arc<ConnectionPool>, retry: RetryPolicy, forwarded_headers: bool) -> Result<Self> {
        let host = target
            .host_str()
            .ok_or_else(|| Error::Proxy(format!("proxy target '{}' has no host", target)))?
            .to_string();
        let tls = match target.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::Proxy(format!("unsupported proxy scheme '{}'", other))),
        };
        let port = target
            .port_or_known_default()
            .ok_or_else(|| Error::Proxy(format!("proxy target '{}' has no port", target)))?;
        Ok(Self {
            key: PoolKey { host, port, tls },
            target,
            pool,
            retry,
            forwarded_headers,
            interceptor: None,
        })
    }

    pub fn with_interceptor(mut self, interceptor: Interceptor) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Upstream request target: the target's base path followed by the
    /// route-relative part of the client's raw target, encoding untouched.
    fn upstream_target(&self, request: &Request, short_path: &str) -> String {
        let base = self.target.path().trim_end_matches('/');
        let remainder = match raw_remainder(request, short_path) {
            Some(raw) => raw.to_string(),
            None => utf8_percent_encode(short_path, PATH_ENCODE).to_string(),
        };
        let mut target = format!("{}/{}", base, remainder);
        if let Some(q) = request.query.as_deref() {
            target.push('?');
            target.push_str(q);
        }
        target
    }

    fn host_header(&self) -> String {
        let default_port = if self.key.tls { 443 } else { 80 };
        if self.key.port == default_port {
            self.key.host.clone()
        } else {
            format!("{}:{}", self.key.host, self.key.port)
        }
    }

    fn build_head(&self, request: &Request, short_path: &str) -> Vec<u8> {
        let connection_listed: Vec<String> = request
            .headers
            .get_all("connection")
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let mut headers = Headers::new();
        for (name, value) in request.headers.iter() {
            let lower = name.to_ascii_lowercase();
            if lower == "host"
                || HOP_BY_HOP.contains(&lower.as_str())
                || connection_listed.contains(&lower)
            {
                continue;
            }
            if self.forwarded_headers && lower.starts_with("x-forwarded-") {
                continue;
            }
            headers.append(name, value);
        }
        headers.set("Host", self.host_header());

        if self.forwarded_headers {
            let peer_ip = request.connection.peer_addr.ip().to_string();
            let forwarded_for = match request.header("x-forwarded-for") {
                Some(prior) => format!("{}, {}", prior, peer_ip),
                None => peer_ip,
            };
            headers.set("X-Forwarded-For", forwarded_for);
            headers.set("X-Forwarded-Proto", request.connection.scheme());
            if let Some(host) = request.header("host") {
                headers.set("X-Forwarded-Host", host);
            }
        }
        if !headers.contains(X_REQUEST_ID) {
            headers.set(X_REQUEST_ID, request.request_id.to_string());
        }
        headers.set("Connection", "keep-alive");

        let mut head = format!(
            "{} {} HTTP/1.1\r\n",
            request.method,
            self.upstream_target(request, short_path)
        )
        .into_bytes();
        headers.write_to(&mut head);
        head.extend_from_slice(b"\r\n");
        head
    }

    async fn attempt(
        &self,
        ctx: &mut RequestContext<'_>,
        head: &[u8],
        fresh: bool,
    ) -> std::result::Result<Option<Response>, AttemptError> {
        let request = ctx.request;

        let mut conn = if fresh {
            self.pool.connect(&self.key).await
        } else {
            self.pool.checkout(&self.key).await
        }
        .map_err(transport)?;
        tracing::trace!(
            request_id = %request.request_id,
            upstream = %self.key,
            connection = conn.id(),
            reused = conn.is_reused(),
            "Forwarding request upstream"
        );

        conn.write_all(head).await.map_err(transport)?;
        if !request.body.is_empty() {
            let mut body = request.body.reader().await.map_err(transport)?;
            tokio::io::copy(&mut body, &mut conn)
                .await
                .map_err(transport)?;
        }
        conn.flush().await.map_err(transport)?;

        let mut reader = UpstreamReader::new(&mut conn);
        let upstream = reader
            .read_head(request.is_head())
            .await
            .map_err(transport)?;

        let intercept = self
            .interceptor
            .as_ref()
            .filter(|i| (i.matches)(request, &upstream));

        let response = match intercept {
            Some(interceptor) => {
                reader.decode_chunks();
                let body = reader.read_to_end().await.map_err(transport)?;
                let body = (interceptor.rewrite)(request, &upstream, body);
                let reusable = reader.is_reusable();
                drop(reader);
                conn.set_reusable(reusable);
                self.pool.release(conn);
                Some(rewritten_response(&upstream, body))
            }
            None => {
                let downstream = &mut *ctx.downstream;
                let before = downstream.bytes_written();
                let relay = async {
                    downstream.write_all(&upstream.raw).await?;
                    while let Some(part) = reader.next_part().await.map_err(upstream_io)? {
                        downstream.write_all(&part).await?;
                    }
                    downstream.flush().await
                };
                if let Err(e) = relay.await {
                    return Err(if downstream.bytes_written() > before {
                        AttemptError::Downstream(e.to_string())
                    } else {
                        AttemptError::Transport(e.to_string())
                    });
                }
                let reusable = reader.is_reusable();
                drop(reader);
                conn.set_reusable(reusable);
                self.pool.release(conn);

                let mut finished = Response::finished(upstream.status);
                if upstream.framing == Framing::UntilClose || !upstream.keep_alive {
                    // The client can only find the end of the body by EOF.
                    finished.headers.set("Connection", "close");
                }
                Some(finished)
            }
        };
        Ok(response)
    }
}

/// Slice of the raw request path that decodes to `short_path`.
///
/// The decoded path minus `short_path` is the matched route prefix; it is
/// walked through the raw path one decoded byte at a time. `None` when the
/// two disagree (the decoded path went through lossy UTF-8 repair).
fn raw_remainder<'a>(request: &'a Request, short_path: &str) -> Option<&'a str> {
    let raw_path = match request.raw_target.split_once('?') {
        Some((path, _)) => path,
        None => request.raw_target.as_str(),
    };
    let prefix = request.path.strip_suffix(short_path)?;
    let raw = raw_path.as_bytes();
    let mut pos = 0;
    for expected in prefix.bytes() {
        let (byte, width) = match raw.get(pos..pos + 3) {
            Some(&[b'%', hi, lo]) => match (hex_value(hi), hex_value(lo)) {
                (Some(hi), Some(lo)) => (hi << 4 | lo, 3),
                _ => (b'%', 1),
            },
            _ => (*raw.get(pos)?, 1),
        };
        if byte != expected {
            return None;
        }
        pos += width;
    }
    raw_path.get(pos..)
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|d| d as u8)
}

fn transport(e: impl std::fmt::Display) -> AttemptError {
    AttemptError::Transport(e.to_string())
}

fn upstream_io(e: UpstreamError) -> std::io::Error {
    match e {
        UpstreamError::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
    }
}

/// Response carrying an intercepted, rewritten body. Framing headers are
/// dropped so the pipeline recomputes them.
fn rewritten_response(upstream: &ResponseHead, body: Bytes) -> Response {
    let mut response = Response::new(upstream.status);
    for (name, value) in upstream.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        response.headers.append(name, value);
    }
    response.body = crate::http::response::ResponseBody::Bytes(body);
    response
}

#[async_trait]
impl Handler for ProxyRoute {
    async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<Option<Response>> {
        let head = self.build_head(ctx.request, ctx.short_path);
        let request_id = ctx.request.request_id;

        let mut attempt = 1;
        loop {
            match self.attempt(ctx, &head, attempt > 1).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Downstream(message)) => {
                    tracing::error!(
                        request_id = %request_id,
                        upstream = %self.key,
                        error = %message,
                        "Proxy relay failed after response started"
                    );
                    metrics::record_proxy_failure();
                    return Err(Error::Proxy(message));
                }
                Err(AttemptError::Transport(message)) => {
                    tracing::warn!(
                        request_id = %request_id,
                        upstream = %self.key,
                        attempt,
                        error = %message,
                        "Proxy attempt failed"
                    );
                    if !self.retry.should_retry(attempt, false) {
                        tracing::error!(
                            request_id = %request_id,
                            upstream = %self.key,
                            attempts = attempt,
                            "Proxy failed, giving up"
                        );
                        metrics::record_proxy_failure();
                        return Ok(Some(Response::text(StatusCode::INTERNAL_SERVER_ERROR, "Proxy error")));
                    }
                    tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
