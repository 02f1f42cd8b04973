//! Request body sinks and the readable body they are promoted to.
//!
//! While a body is arriving it is written into a [`BodySink`]: an in-memory
//! vector below the spool threshold, a temp file at or above it. Once the
//! received length equals Content-Length the sink is promoted, exactly once,
//! into a [`RequestBody`] that can be read from the start any number of times
//! (the proxy relies on that to replay a body on retry).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

/// Where an incoming body is being written.
#[derive(Debug)]
pub enum BodySink {
    Memory(Vec<u8>),
    Spool {
        file: tokio::fs::File,
        path: TempPath,
    },
}

impl BodySink {
    /// Pick a sink for a body of `content_length` bytes.
    pub fn for_length(content_length: u64, spool_threshold: u64) -> io::Result<Self> {
        if content_length >= spool_threshold {
            let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
            tracing::debug!(path = ?path, content_length, "Spooling request body to temp file");
            Ok(BodySink::Spool {
                file: tokio::fs::File::from_std(file),
                path,
            })
        } else {
            // Cap the upfront reservation; the header value is client-controlled.
            let reserve = content_length.min(64 * 1024) as usize;
            Ok(BodySink::Memory(Vec::with_capacity(reserve)))
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            BodySink::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            BodySink::Spool { file, .. } => file.write_all(chunk).await,
        }
    }

    /// Close the write side and produce the readable body.
    pub async fn finish(self, len: u64) -> io::Result<RequestBody> {
        match self {
            BodySink::Memory(buf) => Ok(RequestBody::Memory(Bytes::from(buf))),
            BodySink::Spool { mut file, path } => {
                file.flush().await?;
                file.sync_data().await?;
                drop(file);
                Ok(RequestBody::Spooled(SpooledBody { path, len }))
            }
        }
    }
}

/// A complete request body.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Memory(Bytes),
    Spooled(SpooledBody),
}

/// Body stored in a temp file that is removed when this value drops.
#[derive(Debug)]
pub struct SpooledBody {
    path: TempPath,
    len: u64,
}

impl SpooledBody {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Memory(b) => b.len() as u64,
            RequestBody::Spooled(s) => s.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self, RequestBody::Spooled(_))
    }

    /// A fresh reader positioned at the start of the body.
    pub async fn reader(&self) -> io::Result<BodyReader> {
        match self {
            RequestBody::Empty => Ok(BodyReader::Memory(io::Cursor::new(Bytes::new()))),
            RequestBody::Memory(b) => Ok(BodyReader::Memory(io::Cursor::new(b.clone()))),
            RequestBody::Spooled(s) => {
                let file = tokio::fs::File::open(&s.path).await?;
                Ok(BodyReader::File(file))
            }
        }
    }

    /// Whole body in memory. Spooled bodies are read back from disk.
    pub async fn to_bytes(&self) -> io::Result<Bytes> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Memory(b) => Ok(b.clone()),
            RequestBody::Spooled(s) => {
                let mut out = Vec::with_capacity(s.len as usize);
                self.reader().await?.read_to_end(&mut out).await?;
                Ok(Bytes::from(out))
            }
        }
    }
}

/// Readable view over a [`RequestBody`].
#[derive(Debug)]
pub enum BodyReader {
    Memory(io::Cursor<Bytes>),
    File(tokio::fs::File),
}

impl AsyncRead for BodyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BodyReader::Memory(c) => Pin::new(c).poll_read(cx, buf),
            BodyReader::File(f) => Pin::new(f).poll_read(cx, buf),
        }
    }
}
