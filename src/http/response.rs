//! Logical response model.
//!
//! # Responsibilities
//! - Carry status, headers and exactly one body source
//! - Flag responses that must be chunked or gzip-compressed
//! - Mark responses a handler already wrote itself (proxy passthrough)
//! - Hand the connection to a protocol handler after a `101` (WebSocket)
//!
//! # Design Decisions
//! - The body source is a tagged enum; the pipeline matches on it instead of
//!   probing optional fields
//! - Upgrades are a value on the response; the dispatch loop switches the
//!   connection mode when it sees one

use std::fmt;
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::AsyncRead;

use crate::http::headers::Headers;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Where the response body comes from.
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    /// `length: None` forces chunked transfer.
    Stream {
        reader: BoxReader,
        length: Option<u64>,
    },
    /// Range-capable file body.
    File(PathBuf),
    /// Structured value serialized as JSON.
    Object(serde_json::Value),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            ResponseBody::Stream { length, .. } => write!(f, "Stream(length={:?})", length),
            ResponseBody::File(p) => write!(f, "File({})", p.display()),
            ResponseBody::Object(_) => f.write_str("Object"),
        }
    }
}

/// Result of offering buffered bytes to an upgraded connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStatus {
    /// A unit was consumed; call again.
    Handled,
    /// Not enough bytes buffered for the next unit.
    NeedMore,
    /// The protocol ended; flush output and close.
    Close,
}

/// Takes over interpretation of the receive buffer once a connection has
/// switched protocols.
pub trait UpgradeHandler: Send {
    /// Consume at most one unit from `input`, appending any reply bytes to
    /// `output`.
    fn on_data(&mut self, input: &mut BytesMut, output: &mut Vec<u8>) -> UpgradeStatus;

    /// Connection closed, by either side.
    fn on_close(&mut self) {}
}

pub type AfterSend = Box<dyn FnOnce() + Send>;

pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: ResponseBody,
    pub force_chunked: bool,
    pub force_gzip: bool,
    /// Already written to the client by the handler; the pipeline only runs
    /// post-processors.
    pub finished: bool,
    pub(crate) after_send: Option<AfterSend>,
    pub(crate) upgrade: Option<Box<dyn UpgradeHandler>>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("force_chunked", &self.force_chunked)
            .field("force_gzip", &self.force_gzip)
            .field("finished", &self.finished)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: ResponseBody::Empty,
            force_chunked: false,
            force_gzip: false,
            finished: false,
            after_send: None,
            upgrade: None,
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::bytes(status, "text/plain; charset=utf-8", Bytes::from(body.into()))
    }

    pub fn bytes(status: StatusCode, content_type: &str, body: Bytes) -> Self {
        let mut response = Self::new(status);
        response.headers.set("Content-Type", content_type);
        response.body = ResponseBody::Bytes(body);
        response
    }

    pub fn json(status: StatusCode, value: serde_json::Value) -> Self {
        let mut response = Self::new(status);
        response.headers.set("Content-Type", "application/json");
        response.body = ResponseBody::Object(value);
        response
    }

    pub fn stream(
        status: StatusCode,
        content_type: &str,
        reader: BoxReader,
        length: Option<u64>,
    ) -> Self {
        let mut response = Self::new(status);
        response.headers.set("Content-Type", content_type);
        response.body = ResponseBody::Stream { reader, length };
        response
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        let mut response = Self::new(StatusCode::OK);
        response.body = ResponseBody::File(path.into());
        response
    }

    /// A response the handler has already written in full.
    pub fn finished(status: StatusCode) -> Self {
        let mut response = Self::new(status);
        response.finished = true;
        response
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn chunked(mut self) -> Self {
        self.force_chunked = true;
        self
    }

    pub fn gzip(mut self) -> Self {
        self.force_gzip = true;
        self
    }

    /// Run `f` once the response has been written.
    pub fn on_sent(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.after_send = Some(Box::new(f));
        self
    }

    pub fn with_upgrade(mut self, handler: Box<dyn UpgradeHandler>) -> Self {
        self.upgrade = Some(handler);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Statuses whose responses never carry a body or length framing.
    pub fn is_bodyless_status(&self) -> bool {
        self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_content_type() {
        let r = Response::text(StatusCode::OK, "hi");
        assert_eq!(r.content_type(), Some("text/plain; charset=utf-8"));
        assert!(matches!(r.body, ResponseBody::Bytes(ref b) if &b[..] == b"hi"));

        let r = Response::json(StatusCode::CREATED, serde_json::json!({"ok": true}));
        assert_eq!(r.content_type(), Some("application/json"));
    }

    #[test]
    fn bodyless_statuses() {
        assert!(Response::new(StatusCode::SWITCHING_PROTOCOLS).is_bodyless_status());
        assert!(Response::new(StatusCode::NOT_MODIFIED).is_bodyless_status());
        assert!(!Response::new(StatusCode::OK).is_bodyless_status());
    }
}
