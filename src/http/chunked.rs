//! `Transfer-Encoding: chunked` codec.
//!
//! [`ChunkedEncoder`] wraps any `AsyncRead` and yields chunked framing,
//! optionally gzip-compressing each block through one persistent compressor
//! first. Framing is written so that each chunk carries the `\r\n` that closes
//! the previous one:
//!
//! ```text
//! first:  "<hex>\r\n<data>"
//! next:   "\r\n<hex>\r\n<data>"
//! end:    "\r\n0\r\n\r\n"   ("0\r\n\r\n" if nothing was emitted)
//! ```
//!
//! [`ChunkedDecoder`] is the incremental inverse, used when relaying or
//! rewriting chunked upstream responses.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, ReadBuf};

const BLOCK_SIZE: usize = 16 * 1024;

pub struct ChunkedEncoder<R> {
    source: R,
    gzip: Option<GzEncoder<Vec<u8>>>,
    block: Box<[u8]>,
    pending: BytesMut,
    emitted_any: bool,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkedEncoder<R> {
    pub fn new(source: R) -> Self {
        Self::build(source, None)
    }

    pub fn gzip(source: R) -> Self {
        Self::build(source, Some(GzEncoder::new(Vec::new(), Compression::default())))
    }

    fn build(source: R, gzip: Option<GzEncoder<Vec<u8>>>) -> Self {
        Self {
            source,
            gzip,
            block: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            pending: BytesMut::new(),
            emitted_any: false,
            done: false,
        }
    }

    fn push_chunk(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.emitted_any {
            self.pending.extend_from_slice(b"\r\n");
        }
        self.pending
            .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        self.pending.extend_from_slice(data);
        self.emitted_any = true;
    }

    fn encode_block(&mut self, n: usize) -> io::Result<()> {
        match self.gzip.as_mut() {
            Some(encoder) => {
                encoder.write_all(&self.block[..n])?;
                // Sync flush: emits everything for this block without
                // resetting the compression state.
                encoder.flush()?;
                let compressed = std::mem::take(encoder.get_mut());
                self.push_chunk(&compressed);
            }
            None => {
                let block = std::mem::take(&mut self.block);
                self.push_chunk(&block[..n]);
                self.block = block;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(encoder) = self.gzip.as_mut() {
            encoder.try_finish()?;
            let tail = std::mem::take(encoder.get_mut());
            self.push_chunk(&tail);
        }
        if self.emitted_any {
            self.pending.extend_from_slice(b"\r\n0\r\n\r\n");
        } else {
            self.pending.extend_from_slice(b"0\r\n\r\n");
        }
        self.done = true;
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChunkedEncoder<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(out.remaining());
                out.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            let mut block = ReadBuf::new(&mut this.block);
            ready!(Pin::new(&mut this.source).poll_read(cx, &mut block))?;
            let n = block.filled().len();
            if n == 0 {
                this.finish()?;
            } else {
                this.encode_block(n)?;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkedError {
    #[error("invalid chunk size line")]
    InvalidSize,
    #[error("missing CRLF after chunk data")]
    MissingCrlf,
}

/// Parse a chunk-size line (without its CRLF), ignoring extensions.
pub fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let line = std::str::from_utf8(line).ok()?;
    let hex = line.split(';').next()?.trim();
    if hex.is_empty() {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Size,
    Data(u64),
    DataCrlf,
    Trailer,
    Done,
}

/// Incremental chunked-transfer decoder.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecodeState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Consume as much of `input` as possible, appending payload to `out`.
    /// Returns true once the terminating chunk and trailers were consumed.
    pub fn decode(&mut self, input: &mut BytesMut, out: &mut Vec<u8>) -> Result<bool, ChunkedError> {
        loop {
            match self.state {
                DecodeState::Size => {
                    let Some(pos) = find_crlf(input) else {
                        return Ok(false);
                    };
                    let size = parse_chunk_size(&input[..pos]).ok_or(ChunkedError::InvalidSize)?;
                    input.advance(pos + 2);
                    self.state = if size == 0 {
                        DecodeState::Trailer
                    } else {
                        DecodeState::Data(size)
                    };
                }
                DecodeState::Data(remaining) => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(input.len() as u64) as usize;
                    out.extend_from_slice(&input[..take]);
                    input.advance(take);
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        DecodeState::DataCrlf
                    } else {
                        DecodeState::Data(left)
                    };
                }
                DecodeState::DataCrlf => {
                    if input.len() < 2 {
                        return Ok(false);
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ChunkedError::MissingCrlf);
                    }
                    input.advance(2);
                    self.state = DecodeState::Size;
                }
                DecodeState::Trailer => {
                    let Some(pos) = find_crlf(input) else {
                        return Ok(false);
                    };
                    input.advance(pos + 2);
                    if pos == 0 {
                        self.state = DecodeState::Done;
                    }
                }
                DecodeState::Done => return Ok(true),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tokio::io::AsyncReadExt;

    async fn encode(input: &[u8], gzip: bool) -> Vec<u8> {
        let source = std::io::Cursor::new(input.to_vec());
        let mut encoder = if gzip {
            ChunkedEncoder::gzip(source)
        } else {
            ChunkedEncoder::new(source)
        };
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).await.unwrap();
        out
    }

    fn dechunk(wire: &[u8]) -> Vec<u8> {
        let mut input = BytesMut::from(wire);
        let mut out = Vec::new();
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.decode(&mut input, &mut out).unwrap(), "incomplete chunked stream");
        assert!(input.is_empty());
        out
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn round_trip_plain() {
        for len in [0, 1, 15, BLOCK_SIZE - 1, BLOCK_SIZE, BLOCK_SIZE * 3 + 7] {
            let input = sample(len);
            let wire = encode(&input, false).await;
            assert_eq!(dechunk(&wire), input, "len {}", len);
        }
    }

    #[tokio::test]
    async fn round_trip_gzip() {
        for len in [0, 1, 1000, BLOCK_SIZE * 2 + 5] {
            let input = sample(len);
            let wire = encode(&input, true).await;
            let compressed = dechunk(&wire);
            let mut plain = Vec::new();
            GzDecoder::new(&compressed[..]).read_to_end(&mut plain).unwrap();
            assert_eq!(plain, input, "len {}", len);
        }
    }

    #[tokio::test]
    async fn empty_source_is_terminator_only() {
        assert_eq!(encode(b"", false).await, b"0\r\n\r\n");
    }

    #[tokio::test]
    async fn framing_carries_leading_crlf() {
        let wire = encode(b"abc", false).await;
        assert_eq!(wire, b"3\r\nabc\r\n0\r\n\r\n");
    }

    #[test]
    fn decoder_handles_split_input_and_extensions() {
        let wire = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut input = BytesMut::new();
        let mut out = Vec::new();
        let mut done = false;
        for b in wire.iter() {
            input.extend_from_slice(&[*b]);
            done = decoder.decode(&mut input, &mut out).unwrap();
        }
        assert!(done);
        assert_eq!(out, b"Wikipedia");
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(parse_chunk_size(b"1a"), Some(26));
        assert_eq!(parse_chunk_size(b"FF;name=v"), Some(255));
        assert_eq!(parse_chunk_size(b"zz"), None);
        assert_eq!(parse_chunk_size(b""), None);
    }
}
