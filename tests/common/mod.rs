//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use edge_relay::config::ServerConfig;
use edge_relay::lifecycle::{self, RunningServer, Shutdown};

/// Config bound to ephemeral loopback ports.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.tunnel.bind_address = "127.0.0.1:0".to_string();
    config.timeouts.request_secs = 5;
    config
}

/// Start a full server. Keep the `Shutdown` alive for the test's duration.
pub async fn start_server(config: ServerConfig) -> (RunningServer, Shutdown) {
    let shutdown = Shutdown::new();
    let running = lifecycle::start(&config, &shutdown).await.unwrap();
    (running, shutdown)
}

/// Send raw bytes and read until the server closes the connection.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    out
}

/// Response split into head text and body bytes.
pub struct RawResponse {
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn parse(bytes: &[u8]) -> Self {
        let split = bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response has no header terminator");
        Self {
            head: String::from_utf8_lossy(&bytes[..split]).into_owned(),
            body: bytes[split + 4..].to_vec(),
        }
    }

    pub fn status(&self) -> u16 {
        self.head[9..12].parse().unwrap()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read one response with a `Content-Length` body from a kept-alive stream.
pub async fn read_response<R: AsyncRead + Unpin>(stream: &mut R) -> RawResponse {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed mid-head");
        buf.push(byte[0]);
    }
    let mut response = RawResponse::parse(&buf);
    let len: usize = response
        .header("content-length")
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    response.body = body;
    response
}

/// Decode a chunked body.
pub fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = data.windows(2).position(|w| w == b"\r\n").unwrap();
        let size = usize::from_str_radix(std::str::from_utf8(&data[..line_end]).unwrap().trim(), 16).unwrap();
        data = &data[line_end + 2..];
        if size == 0 {
            return out;
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

/// Read an upstream request head plus its `Content-Length` body.
pub async fn read_request(socket: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut block = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut block).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&block[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let len: usize = head
        .lines()
        .find_map(|l| {
            let (n, v) = l.split_once(':')?;
            n.eq_ignore_ascii_case("content-length").then(|| v.trim().parse().ok())?
        })
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < len {
        let n = socket.read(&mut block).await.ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&block[..n]);
    }
    Some((head, body))
}

/// A mock upstream and the number of TCP connections it accepted.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// How the mock frames its responses.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length`, connection kept open.
    KeepAlive,
    /// `Transfer-Encoding: chunked`, connection kept open.
    Chunked,
    /// No length; the body ends when the connection closes.
    UntilClose,
}

/// Upstream answering every request with `respond(head, body)`.
pub async fn start_backend<F>(framing: Framing, respond: F) -> MockBackend
where
    F: Fn(&str, &[u8]) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                while let Some((head, body)) = read_request(&mut socket).await {
                    let reply = respond(&head, &body);
                    let wire = match framing {
                        Framing::KeepAlive => format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                            reply.len(),
                            reply
                        ),
                        Framing::Chunked => {
                            let half = reply.len() / 2;
                            let (a, b) = reply.split_at(half);
                            let mut wire = String::from(
                                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n",
                            );
                            for part in [a, b] {
                                if !part.is_empty() {
                                    wire.push_str(&format!("{:x}\r\n{}\r\n", part.len(), part));
                                }
                            }
                            wire.push_str("0\r\n\r\n");
                            wire
                        }
                        Framing::UntilClose => {
                            format!("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n{}", reply)
                        }
                    };
                    if socket.write_all(wire.as_bytes()).await.is_err() {
                        return;
                    }
                    if framing == Framing::UntilClose {
                        let _ = socket.shutdown().await;
                        return;
                    }
                }
            });
        }
    });

    MockBackend { addr, connections }
}

/// Upstream that drops the first `failures` connections without answering.
pub async fn start_flaky_backend(failures: usize, body: &'static str) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if seen < failures {
                    let _ = read_request(&mut socket).await;
                    return;
                }
                while read_request(&mut socket).await.is_some() {
                    let wire = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
                    if socket.write_all(wire.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    MockBackend { addr, connections }
}

/// Upstream that answers each request with `100 Continue`, pauses, then
/// sends the final `200` with `body`.
pub async fn start_interim_backend(body: &'static str) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while read_request(&mut socket).await.is_some() {
                    if socket.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let wire = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
                    if socket.write_all(wire.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    MockBackend { addr, connections }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Poll `cond` until it holds or a few seconds pass.
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
