//! Socket-shaped stream for one virtual client on the satellite.
//!
//! Reads are fed by `Data` frames addressed to the client; the sender being
//! dropped is EOF. Writes become `Data` frames on the shared tunnel writer,
//! with backpressure from its bounded channel.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::tunnel::frame::Frame;

/// Satellite-side handle used to feed and close a [`VirtualStream`].
#[derive(Debug)]
pub struct ShimHandle {
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    closed: Arc<AtomicBool>,
}

impl ShimHandle {
    /// Hand bytes to the local parser. An empty chunk ends the request side.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            self.inbound = None;
            return true;
        }
        match &self.inbound {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    /// The primary dropped the client: reads hit EOF, writes fail.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.inbound = None;
    }
}

pub struct VirtualStream {
    client_id: u64,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    outbound: PollSender<Frame>,
    closed: Arc<AtomicBool>,
    max_payload: usize,
}

impl VirtualStream {
    pub fn new(client_id: u64, outbound: mpsc::Sender<Frame>, max_payload: usize) -> (Self, ShimHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let stream = Self {
            client_id,
            inbound: rx,
            pending: Bytes::new(),
            outbound: PollSender::new(outbound),
            closed: Arc::clone(&closed),
            max_payload,
        };
        let handle = ShimHandle {
            inbound: Some(tx),
            closed,
        };
        (stream, handle)
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "virtual client closed")
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(broken_pipe()));
        }
        // An empty Data frame means end of stream; never emit one here.
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(broken_pipe()));
        }
        let n = buf.len().min(this.max_payload);
        let frame = Frame::Data {
            client_id: this.client_id,
            payload: Bytes::copy_from_slice(&buf[..n]),
        };
        match this.outbound.send_item(frame) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(broken_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outbound.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn reads_pushed_chunks_until_end_marker() {
        let (tx, _rx) = mpsc::channel(4);
        let (mut stream, mut handle) = VirtualStream::new(9, tx, 1024);
        assert!(handle.push(Bytes::from_static(b"GET / HTTP/1.1\r\n")));
        assert!(handle.push(Bytes::from_static(b"\r\n")));
        assert!(handle.push(Bytes::new()));

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn writes_become_bounded_data_frames() {
        let (tx, mut rx) = mpsc::channel(4);
        let (mut stream, _handle) = VirtualStream::new(9, tx, 4);
        stream.write_all(b"abcdef").await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Frame::Data {
                client_id: 9,
                payload: Bytes::from_static(b"abcd")
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(Frame::Data {
                client_id: 9,
                payload: Bytes::from_static(b"ef")
            })
        );
    }

    #[tokio::test]
    async fn closed_shim_rejects_writes() {
        let (tx, _rx) = mpsc::channel(4);
        let (mut stream, mut handle) = VirtualStream::new(9, tx, 1024);
        handle.close();
        assert!(stream.write_all(b"x").await.is_err());
        let mut buf = Vec::new();
        assert_eq!(stream.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
