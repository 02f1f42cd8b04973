//! Response pipeline: turns a logical [`Response`] into wire bytes.
//!
//! # Responsibilities
//! - Resolve the body source into fixed bytes, a sized stream or an
//!   unsized stream
//! - Serve byte ranges of file bodies (`206` + `Content-Range`)
//! - Negotiate gzip for unsized streams of allow-listed content types
//! - Frame the body with exactly one of `Content-Length` or chunked transfer
//! - Skip body bytes for `HEAD`
//! - Run post-processors for every response, finished ones included
//!
//! # Data Flow
//! ```text
//! Response ─▶ resolve body ─▶ range? ─▶ gzip? ─▶ framing headers ─▶ head bytes
//!                                                   └─▶ ChunkedEncoder ─▶ Downstream
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::config::HttpConfig;
use crate::http::chunked::ChunkedEncoder;
use crate::http::request::Request;
use crate::http::response::{BoxReader, Response, ResponseBody, UpgradeHandler};

const COPY_BLOCK: usize = 16 * 1024;

/// Write side of a client connection. Counts bytes so the dispatcher can tell
/// whether a response has started.
pub struct Downstream {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    written: u64,
}

impl Downstream {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self { writer, written: 0 }
    }

    /// Total bytes written over the connection's lifetime.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Copy `reader` to the client until EOF.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut block = vec![0u8; COPY_BLOCK];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut block).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write_all(&block[..n]).await?;
            total += n as u64;
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// What a post-processor sees about a completed response.
#[derive(Debug)]
pub struct ResponseRecord<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub status: StatusCode,
    pub elapsed: Duration,
}

pub type PostProcessor = Arc<dyn Fn(&ResponseRecord<'_>) + Send + Sync>;

#[derive(Clone)]
pub struct ResponsePipeline {
    gzip_types: Vec<String>,
    server_name: String,
    post_processors: Vec<PostProcessor>,
}

enum ResolvedBody {
    Empty,
    Fixed(Bytes),
    Stream {
        reader: BoxReader,
        length: Option<u64>,
    },
}

impl ResponsePipeline {
    pub fn new(config: &HttpConfig) -> Self {
        Self {
            gzip_types: config
                .gzip_content_types
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            server_name: config.server_name.clone(),
            post_processors: Vec::new(),
        }
    }

    pub fn with_post_processor(mut self, processor: PostProcessor) -> Self {
        self.post_processors.push(processor);
        self
    }

    /// Write `response` for `request`. Returns the upgrade handler if the
    /// response switched protocols.
    pub async fn send(
        &self,
        out: &mut Downstream,
        request: &Request,
        mut response: Response,
        started: Instant,
    ) -> io::Result<Option<Box<dyn UpgradeHandler>>> {
        if !response.finished {
            self.write_response(out, request, &mut response).await?;
        }

        if let Some(after_send) = response.after_send.take() {
            after_send();
        }
        let record = ResponseRecord {
            method: &request.method,
            path: &request.path,
            status: response.status,
            elapsed: started.elapsed(),
        };
        for processor in &self.post_processors {
            processor(&record);
        }

        Ok(response.upgrade.take())
    }

    async fn write_response(
        &self,
        out: &mut Downstream,
        request: &Request,
        response: &mut Response,
    ) -> io::Result<()> {
        response.headers.set("Server", self.server_name.clone());

        let body = std::mem::replace(&mut response.body, ResponseBody::Empty);
        let mut resolved = self.resolve_body(request, response, body).await?;

        if response.is_bodyless_status() {
            response.headers.remove("Content-Length");
            response.headers.remove("Transfer-Encoding");
            let head = serialize_head(response);
            out.write_all(&head).await?;
            return out.flush().await;
        }

        let gzip = request.accepts_gzip()
            && match &resolved {
                ResolvedBody::Stream { length: None, .. } => {
                    response.force_gzip || self.gzip_allowed(response.content_type())
                }
                ResolvedBody::Empty => false,
                _ => response.force_gzip,
            };
        let chunked = gzip
            || response.force_chunked
            || matches!(resolved, ResolvedBody::Stream { length: None, .. });

        if chunked {
            resolved = match resolved {
                ResolvedBody::Fixed(bytes) => ResolvedBody::Stream {
                    reader: Box::new(io::Cursor::new(bytes)),
                    length: None,
                },
                other => other,
            };
            response.headers.remove("Content-Length");
            response.headers.set("Transfer-Encoding", "chunked");
            if gzip {
                response.headers.set("Content-Encoding", "gzip");
                response.headers.set("Vary", "Accept-Encoding");
            }
        } else {
            let length = match &resolved {
                ResolvedBody::Empty => 0,
                ResolvedBody::Fixed(b) => b.len() as u64,
                ResolvedBody::Stream { length, .. } => length.unwrap_or(0),
            };
            response.headers.remove("Transfer-Encoding");
            response.headers.set("Content-Length", length.to_string());
        }

        let head = serialize_head(response);
        out.write_all(&head).await?;

        if request.method == Method::HEAD {
            // Dropping the resolved body closes any opened file or stream.
            return out.flush().await;
        }

        match resolved {
            ResolvedBody::Empty => {}
            ResolvedBody::Fixed(bytes) => out.write_all(&bytes).await?,
            ResolvedBody::Stream { reader, length: _ } if chunked => {
                let mut encoder = if gzip {
                    ChunkedEncoder::gzip(reader)
                } else {
                    ChunkedEncoder::new(reader)
                };
                out.copy_from(&mut encoder).await?;
            }
            ResolvedBody::Stream { reader, length } => {
                let expected = length.unwrap_or(0);
                let copied = out.copy_from(&mut reader.take(expected)).await?;
                if copied != expected {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("response stream ended after {} of {} bytes", copied, expected),
                    ));
                }
            }
        }
        out.flush().await
    }

    async fn resolve_body(
        &self,
        request: &Request,
        response: &mut Response,
        body: ResponseBody,
    ) -> io::Result<ResolvedBody> {
        Ok(match body {
            ResponseBody::Empty => ResolvedBody::Empty,
            ResponseBody::Bytes(bytes) => ResolvedBody::Fixed(bytes),
            ResponseBody::Object(value) => {
                let bytes = serde_json::to_vec(&value).map_err(io::Error::other)?;
                if !response.headers.contains("content-type") {
                    response.headers.set("Content-Type", "application/json");
                }
                ResolvedBody::Fixed(Bytes::from(bytes))
            }
            ResponseBody::Stream { reader, length } => ResolvedBody::Stream { reader, length },
            ResponseBody::File(path) => self.resolve_file(request, response, &path).await?,
        })
    }

    async fn resolve_file(
        &self,
        request: &Request,
        response: &mut Response,
        path: &Path,
    ) -> io::Result<ResolvedBody> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "File body not found");
                response.status = StatusCode::NOT_FOUND;
                response.headers.set("Content-Type", "text/plain; charset=utf-8");
                return Ok(ResolvedBody::Fixed(Bytes::from_static(b"Not Found")));
            }
            Err(e) => return Err(e),
        };
        let total = file.metadata().await?.len();

        response.headers.set("Accept-Ranges", "bytes");
        if !response.headers.contains("content-type") {
            response.headers.set("Content-Type", content_type_for(path));
        }

        let range = request
            .header("range")
            .and_then(|value| parse_range(value, total));
        match range {
            Some((start, end)) => {
                file.seek(io::SeekFrom::Start(start)).await?;
                let length = end - start + 1;
                response.status = StatusCode::PARTIAL_CONTENT;
                response
                    .headers
                    .set("Content-Range", format!("bytes {}-{}/{}", start, end, total));
                Ok(ResolvedBody::Stream {
                    reader: Box::new(file.take(length)),
                    length: Some(length),
                })
            }
            None => Ok(ResolvedBody::Stream {
                reader: Box::new(file),
                length: Some(total),
            }),
        }
    }

    fn gzip_allowed(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        let content_type = content_type.to_ascii_lowercase();
        self.gzip_types.iter().any(|t| content_type.starts_with(t))
    }
}

/// Parse a `Range` header against a body of `total` bytes, clamping the
/// bounds into the body instead of rejecting them. Only the first range of a
/// list is honoured.
pub fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let spec = value.trim().strip_prefix("bytes=")?;
    let first = spec.split(',').next()?.trim();
    let (a, b) = first.split_once('-')?;
    let (a, b) = (a.trim(), b.trim());
    let last = total - 1;

    let (start, end) = match (a.is_empty(), b.is_empty()) {
        (true, true) => return None,
        (true, false) => {
            let n: u64 = b.parse().ok()?;
            if n == 0 {
                return None;
            }
            (total.saturating_sub(n), last)
        }
        (false, true) => (a.parse::<u64>().ok()?.min(last), last),
        (false, false) => {
            let start = a.parse::<u64>().ok()?.min(last);
            let end = b.parse::<u64>().ok()?.min(last);
            (start.min(end), start.max(end))
        }
    };
    Some((start, end))
}

fn serialize_head(response: &Response) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            response.status.as_u16(),
            response.status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    response.headers.write_to(&mut head);
    head.extend_from_slice(b"\r\n");
    head
}

/// Content type by file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "txt" | "log" => "text/plain; charset=utf-8",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
