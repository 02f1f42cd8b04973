//! Incremental HTTP/1.1 request parser.
//!
//! One [`RequestParser`] lives for the whole lifetime of a connection. Bytes
//! are appended with [`RequestParser::feed`] in whatever pieces the transport
//! delivers; [`RequestParser::next_request`] is then called until it returns
//! `None` ("need more bytes"). Each returned request resets the per-request
//! state, so pipelined requests come out one after another.
//!
//! ```text
//! feed(bytes) ─▶ fixed receive buffer ─▶ AwaitHead ──blank line──▶ AwaitBody ──len reached──▶ Request
//!                  (overflow = fatal)        ▲                        │ drains into BodySink
//!                                            └────────────────────────┘
//! ```

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use http::{Method, Version};
use percent_encoding::percent_decode_str;
use uuid::Uuid;

use crate::http::body::{BodySink, RequestBody};
use crate::http::form;
use crate::http::headers::{parse_content_length, Headers};
use crate::http::request::{ConnectionInfo, Request};

const MAX_HEADERS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("request exceeds the {capacity}-byte receive buffer")]
    BufferOverflow { capacity: usize },

    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("request Transfer-Encoding is not supported")]
    UnsupportedTransferEncoding,

    #[error("body spooling failed: {0}")]
    Spool(#[from] std::io::Error),
}

/// Buffer and spooling limits for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub buffer_capacity: usize,
    pub spool_threshold: u64,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            buffer_capacity: 512 * 1024,
            spool_threshold: 10 * 1024 * 1024,
        }
    }
}

/// Request line and headers, before the body has arrived.
#[derive(Debug)]
struct RequestHead {
    method: Method,
    raw_target: String,
    path: String,
    query: Option<String>,
    version: Version,
    host: String,
    headers: Headers,
    content_length: u64,
    content_type: Option<String>,
}

#[derive(Debug)]
enum ParseState {
    AwaitHead,
    AwaitBody {
        head: RequestHead,
        sink: BodySink,
        received: u64,
    },
}

/// Per-connection incremental parse state.
#[derive(Debug)]
pub struct RequestParser {
    buf: BytesMut,
    limits: ParserLimits,
    connection: ConnectionInfo,
    state: ParseState,
}

impl RequestParser {
    pub fn new(connection: ConnectionInfo, limits: ParserLimits) -> Self {
        Self {
            buf: BytesMut::with_capacity(limits.buffer_capacity.min(64 * 1024)),
            limits,
            connection,
            state: ParseState::AwaitHead,
        }
    }

    pub fn capacity(&self) -> usize {
        self.limits.buffer_capacity
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True when no request is partially received.
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty() && matches!(self.state, ParseState::AwaitHead)
    }

    /// Direct access to unconsumed bytes (used once a connection is upgraded).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append received bytes. Overflowing the fixed buffer is fatal for the
    /// connection.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if self.buf.len() + data.len() > self.limits.buffer_capacity {
            return Err(ParseError::BufferOverflow {
                capacity: self.limits.buffer_capacity,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Advance as far as the buffered bytes allow. Returns a request once its
    /// head and full body have arrived; `None` means more bytes are needed.
    pub async fn next_request(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            match &mut self.state {
                ParseState::AwaitHead => {
                    let Some(head) = self.parse_head()? else {
                        return Ok(None);
                    };
                    if head.content_length == 0 {
                        let request = self.build(head, RequestBody::Empty).await;
                        return Ok(Some(request));
                    }
                    let sink = BodySink::for_length(head.content_length, self.limits.spool_threshold)?;
                    self.state = ParseState::AwaitBody {
                        head,
                        sink,
                        received: 0,
                    };
                }
                ParseState::AwaitBody { head, sink, received } => {
                    let remaining = head.content_length - *received;
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    if take > 0 {
                        let chunk = self.buf.split_to(take);
                        sink.write(&chunk).await?;
                        *received += take as u64;
                    }
                    if *received < head.content_length {
                        return Ok(None);
                    }

                    let state = std::mem::replace(&mut self.state, ParseState::AwaitHead);
                    let ParseState::AwaitBody { head, sink, received } = state else {
                        unreachable!("state checked above");
                    };
                    let body = sink.finish(received).await?;
                    let request = self.build(head, body).await;
                    return Ok(Some(request));
                }
            }
        }
    }

    fn parse_head(&mut self) -> Result<Option<RequestHead>, ParseError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut raw_headers);

        let consumed = match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::Token) | Err(httparse::Error::Version) => {
                return Err(ParseError::InvalidRequestLine)
            }
            Err(e) => return Err(ParseError::InvalidHeader(e.to_string())),
        };

        let method = parsed
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or(ParseError::InvalidRequestLine)?;
        let raw_target = parsed.path.ok_or(ParseError::InvalidRequestLine)?.to_string();
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut headers = Headers::new();
        for h in parsed.headers.iter() {
            headers.append(h.name, String::from_utf8_lossy(h.value).into_owned());
        }

        if headers.contains("transfer-encoding") {
            return Err(ParseError::UnsupportedTransferEncoding);
        }

        let content_length = match headers.get("content-length") {
            Some(v) => parse_content_length(v).ok_or(ParseError::InvalidContentLength)?,
            None => 0,
        };

        let (raw_path, query) = match raw_target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (raw_target.as_str(), None),
        };
        let path = percent_decode_str(raw_path).decode_utf8_lossy().into_owned();

        let host = headers
            .get("host")
            .map(strip_port)
            .unwrap_or_default()
            .to_ascii_lowercase();
        let content_type = headers.get("content-type").map(str::to_string);

        self.buf.advance(consumed);

        Ok(Some(RequestHead {
            method,
            raw_target,
            path,
            query,
            version,
            host,
            headers,
            content_length,
            content_type,
        }))
    }

    async fn build(&self, head: RequestHead, body: RequestBody) -> Request {
        let mut request = Request {
            method: head.method,
            raw_target: head.raw_target,
            path: head.path,
            query: head.query,
            version: head.version,
            host: head.host,
            headers: head.headers,
            content_length: head.content_length,
            content_type: head.content_type,
            body,
            params: HashMap::new(),
            files: Vec::new(),
            json: None,
            connection: self.connection,
            request_id: Uuid::new_v4(),
        };
        form::bind(&mut request).await;
        request
    }
}

/// `example.com:8080` -> `example.com`, `[::1]:80` -> `[::1]`.
fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
