//! Streaming reader for upstream responses.
//!
//! Reads the response head, then yields the body in pieces according to its
//! framing: bounded by `Content-Length`, walked chunk by chunk for
//! `Transfer-Encoding: chunked`, or read to EOF when neither is present (the
//! connection can then not be reused). Chunked bodies can be yielded
//! verbatim, framing included, for passthrough, or decoded for interception.
//!
//! All reads go through a lookahead buffer: bytes are only consumed once a
//! complete unit (head, size line, CRLF) is present, so partial units are
//! effectively peeked and rewound.

use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::http::chunked::parse_chunk_size;
use crate::http::headers::{parse_content_length, Headers};

const MAX_HEAD: usize = 64 * 1024;
const MAX_LINE: usize = 4 * 1024;
const READ_BLOCK: usize = 16 * 1024;
const MAX_HEADERS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream closed the connection before responding")]
    ClosedBeforeResponse,
    #[error("upstream response head is malformed: {0}")]
    MalformedHead(String),
    #[error("upstream response head too large")]
    HeadTooLarge,
    #[error("invalid chunked framing from upstream")]
    MalformedChunk,
    #[error("upstream closed the connection mid-body")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Headers,
    pub framing: Framing,
    /// Upstream allows the connection to be reused.
    pub keep_alive: bool,
    /// The head exactly as received.
    pub raw: Bytes,
}

fn is_interim(status: StatusCode) -> bool {
    status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
    Done,
}

enum Step {
    Progress,
    NeedMore,
    Done,
}

#[derive(Debug)]
pub struct UpstreamReader<R> {
    inner: R,
    lookahead: BytesMut,
    body: BodyState,
    echo_framing: bool,
    keep_alive: bool,
    failed: bool,
}

impl<R: AsyncRead + Unpin> UpstreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            lookahead: BytesMut::with_capacity(READ_BLOCK),
            body: BodyState::Done,
            echo_framing: true,
            keep_alive: false,
            failed: false,
        }
    }

    /// Yield decoded chunk payloads instead of the raw chunked framing.
    pub fn decode_chunks(&mut self) {
        self.echo_framing = false;
    }

    /// True once the body has been read to its end without any framing
    /// violation and the upstream allows keep-alive.
    pub fn is_reusable(&self) -> bool {
        !self.failed
            && self.keep_alive
            && self.body == BodyState::Done
            && self.lookahead.is_empty()
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        self.lookahead.reserve(READ_BLOCK);
        self.inner.read_buf(&mut self.lookahead).await
    }

    /// Read the status line and headers of the final response. Interim `1xx`
    /// heads other than `101` are consumed and skipped. `head_request` means
    /// no body follows regardless of the headers.
    pub async fn read_head(&mut self, head_request: bool) -> Result<ResponseHead, UpstreamError> {
        loop {
            match self.try_parse_head(head_request) {
                Ok(Some(head)) if is_interim(head.status) => {
                    tracing::trace!(status = head.status.as_u16(), "Skipping interim upstream response");
                    continue;
                }
                Ok(Some(head)) => return Ok(head),
                Ok(None) => {}
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
            if self.lookahead.len() > MAX_HEAD {
                self.failed = true;
                return Err(UpstreamError::HeadTooLarge);
            }
            let n = self.fill().await.map_err(|e| {
                self.failed = true;
                e
            })?;
            if n == 0 {
                self.failed = true;
                return Err(if self.lookahead.is_empty() {
                    UpstreamError::ClosedBeforeResponse
                } else {
                    UpstreamError::MalformedHead("connection closed mid-head".into())
                });
            }
        }
    }

    fn try_parse_head(&mut self, head_request: bool) -> Result<Option<ResponseHead>, UpstreamError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut raw_headers);
        let consumed = match parsed.parse(&self.lookahead) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(UpstreamError::MalformedHead(e.to_string())),
        };

        let code = parsed
            .code
            .ok_or_else(|| UpstreamError::MalformedHead("missing status".into()))?;
        let status = StatusCode::from_u16(code).map_err(|e| UpstreamError::MalformedHead(e.to_string()))?;
        let http10 = parsed.version == Some(0);

        let mut headers = Headers::new();
        for h in parsed.headers.iter() {
            headers.append(h.name, String::from_utf8_lossy(h.value).into_owned());
        }

        let bodyless = head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let framing = if bodyless {
            Framing::Length(0)
        } else if headers.has_token("transfer-encoding", "chunked") {
            Framing::Chunked
        } else if let Some(cl) = headers.get("content-length") {
            let len = parse_content_length(cl)
                .ok_or_else(|| UpstreamError::MalformedHead("invalid Content-Length".into()))?;
            Framing::Length(len)
        } else {
            Framing::UntilClose
        };

        let keep_alive = if headers.has_token("connection", "close") {
            false
        } else if http10 {
            headers.has_token("connection", "keep-alive")
        } else {
            true
        };

        let raw = self.lookahead.split_to(consumed).freeze();
        self.keep_alive = keep_alive && framing != Framing::UntilClose;
        self.body = match framing {
            Framing::Length(0) => BodyState::Done,
            Framing::Length(n) => BodyState::Length(n),
            Framing::Chunked => BodyState::Chunked(ChunkState::Size),
            Framing::UntilClose => BodyState::UntilClose,
        };

        Ok(Some(ResponseHead {
            status,
            headers,
            framing,
            keep_alive,
            raw,
        }))
    }

    /// Next piece of the body, or `None` at its end.
    pub async fn next_part(&mut self) -> Result<Option<Bytes>, UpstreamError> {
        let mut out = BytesMut::new();
        loop {
            let step = match self.step(&mut out) {
                Ok(step) => step,
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            };
            match step {
                Step::Progress => continue,
                Step::Done => {
                    return Ok(if out.is_empty() { None } else { Some(out.freeze()) });
                }
                Step::NeedMore => {
                    if !out.is_empty() {
                        return Ok(Some(out.freeze()));
                    }
                    let n = self.fill().await.map_err(|e| {
                        self.failed = true;
                        UpstreamError::from(e)
                    })?;
                    if n == 0 {
                        if self.body == BodyState::UntilClose {
                            self.body = BodyState::Done;
                            return Ok(None);
                        }
                        self.failed = true;
                        return Err(UpstreamError::Truncated);
                    }
                }
            }
        }
    }

    /// Read the remaining body into memory.
    pub async fn read_to_end(&mut self) -> Result<Bytes, UpstreamError> {
        let mut body = BytesMut::new();
        while let Some(part) = self.next_part().await? {
            body.extend_from_slice(&part);
        }
        Ok(body.freeze())
    }

    /// Advance over whatever is buffered. Never performs I/O.
    fn step(&mut self, out: &mut BytesMut) -> Result<Step, UpstreamError> {
        match self.body {
            BodyState::Done => Ok(Step::Done),
            BodyState::UntilClose => {
                if self.lookahead.is_empty() {
                    return Ok(Step::NeedMore);
                }
                out.extend_from_slice(&self.lookahead.split());
                Ok(Step::NeedMore)
            }
            BodyState::Length(remaining) => {
                if self.lookahead.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let take = remaining.min(self.lookahead.len() as u64) as usize;
                out.extend_from_slice(&self.lookahead.split_to(take));
                let left = remaining - take as u64;
                self.body = if left == 0 {
                    BodyState::Done
                } else {
                    BodyState::Length(left)
                };
                Ok(Step::Progress)
            }
            BodyState::Chunked(state) => self.step_chunked(state, out),
        }
    }

    fn step_chunked(&mut self, state: ChunkState, out: &mut BytesMut) -> Result<Step, UpstreamError> {
        match state {
            ChunkState::Size => {
                let Some(line) = self.take_line()? else {
                    return Ok(Step::NeedMore);
                };
                let size = parse_chunk_size(&line[..line.len() - 2]).ok_or(UpstreamError::MalformedChunk)?;
                if self.echo_framing {
                    out.extend_from_slice(&line);
                }
                self.body = BodyState::Chunked(if size == 0 {
                    ChunkState::Trailer
                } else {
                    ChunkState::Data(size)
                });
                Ok(Step::Progress)
            }
            ChunkState::Data(remaining) => {
                if self.lookahead.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let take = remaining.min(self.lookahead.len() as u64) as usize;
                out.extend_from_slice(&self.lookahead.split_to(take));
                let left = remaining - take as u64;
                self.body = BodyState::Chunked(if left == 0 {
                    ChunkState::DataCrlf
                } else {
                    ChunkState::Data(left)
                });
                Ok(Step::Progress)
            }
            ChunkState::DataCrlf => {
                if self.lookahead.len() < 2 {
                    return Ok(Step::NeedMore);
                }
                if &self.lookahead[..2] != b"\r\n" {
                    return Err(UpstreamError::MalformedChunk);
                }
                if self.echo_framing {
                    out.extend_from_slice(b"\r\n");
                }
                self.lookahead.advance(2);
                self.body = BodyState::Chunked(ChunkState::Size);
                Ok(Step::Progress)
            }
            ChunkState::Trailer => {
                let Some(line) = self.take_line()? else {
                    return Ok(Step::NeedMore);
                };
                if self.echo_framing {
                    out.extend_from_slice(&line);
                }
                if line.len() == 2 {
                    self.body = BodyState::Done;
                }
                Ok(Step::Progress)
            }
        }
    }

    /// Take one CRLF-terminated line (CRLF included) if fully buffered.
    fn take_line(&mut self) -> Result<Option<BytesMut>, UpstreamError> {
        match self.lookahead.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => Ok(Some(self.lookahead.split_to(pos + 2))),
            None if self.lookahead.len() > MAX_LINE => Err(UpstreamError::MalformedChunk),
            None => Ok(None),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
