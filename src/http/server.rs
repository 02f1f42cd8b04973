//! HTTP/1.1 connection server and dispatch loop.
//!
//! # Responsibilities
//! - Accept connections (optionally terminating TLS) within the listener's
//!   connection limit
//! - Feed received bytes to the connection's [`RequestParser`]
//! - Resolve each complete request against the [`RouteTable`] and run the
//!   handler under the request deadline, catching errors and panics
//! - Write responses through the [`ResponsePipeline`], pipelined requests in
//!   order
//! - Switch the connection to an [`UpgradeHandler`] after a `101`
//! - Keep reading the client while a handler runs; a disconnect drops the
//!   handler, releasing whatever upstream resource it holds
//!
//! # Design Decisions
//! - One task per connection; a connection's requests are strictly
//!   sequential
//! - The connection is either parsing HTTP or upgraded, never both
//! - Receive-buffer overflow closes the connection without a response
//! - Generic over the byte stream so the tunnel shim reuses the same loop

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::http::parser::{ParseError, ParserLimits, RequestParser};
use crate::http::pipeline::{Downstream, ResponsePipeline};
use crate::http::request::{ConnectionInfo, Request};
use crate::http::response::{Response, UpgradeHandler, UpgradeStatus};
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};
use crate::net::stream::MaybeTlsStream;
use crate::observability::metrics;
use crate::resilience::timeouts::{with_timeout, Deadlines, TimeoutError};
use crate::routing::handler::RequestContext;
use crate::routing::table::RouteTable;

const READ_BLOCK: usize = 16 * 1024;

/// Connection-level protocol state.
enum ConnectionMode {
    ParsingHttp,
    Upgraded(Box<dyn UpgradeHandler>),
}

/// What the loop does after a request was answered.
enum AfterResponse {
    KeepAlive,
    Close,
    Upgrade(Box<dyn UpgradeHandler>),
}

enum HandlerOutcome {
    Response(Response),
    NoMatch,
    Failed(Error),
    TimedOut(TimeoutError),
    Disconnected(ClientEvent),
}

/// What a read-side EOF means while a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEof {
    /// The peer is gone: the in-flight handler is dropped.
    Abort,
    /// The peer is done sending but still reads the response.
    HalfClose,
}

enum ClientEvent {
    Closed,
    Overflow { capacity: usize },
}

/// Client half of a connection, read while a handler runs. Bytes that
/// arrive meanwhile go to the parser as they would between requests.
struct ClientWatch<'a, R> {
    reader: &'a mut R,
    parser: &'a mut RequestParser,
    block: &'a mut [u8],
    on_eof: ClientEof,
    eof: bool,
}

impl<R: AsyncRead + Unpin> ClientWatch<'_, R> {
    /// Resolves when the client disconnects or overflows the receive buffer.
    /// After a tolerated half-close it never resolves.
    async fn disconnected(&mut self) -> ClientEvent {
        loop {
            if self.eof {
                return std::future::pending().await;
            }
            match self.reader.read(self.block).await {
                Ok(0) if self.on_eof == ClientEof::HalfClose => self.eof = true,
                Ok(0) | Err(_) => return ClientEvent::Closed,
                Ok(n) => {
                    if let Err(ParseError::BufferOverflow { capacity }) = self.parser.feed(&self.block[..n]) {
                        return ClientEvent::Overflow { capacity };
                    }
                }
            }
        }
    }
}

pub struct HttpServer {
    routes: Arc<RouteTable>,
    pipeline: ResponsePipeline,
    limits: ParserLimits,
    deadlines: Deadlines,
    tls: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
}

impl HttpServer {
    pub fn new(config: &ServerConfig, routes: Arc<RouteTable>, tls: Option<TlsAcceptor>) -> Self {
        let pipeline = ResponsePipeline::new(&config.http).with_post_processor(Arc::new(|record| {
            metrics::record_request(record.method.as_str(), record.status.as_u16(), record.elapsed);
        }));
        Self {
            routes,
            pipeline,
            limits: ParserLimits {
                buffer_capacity: config.http.receive_buffer_bytes,
                spool_threshold: config.http.spool_threshold_bytes,
            },
            deadlines: Deadlines::from_config(&config.timeouts),
            tls,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp, peer_addr, permit) = match accepted {
                        Ok(conn) => conn,
                        Err(ListenerError::Closed) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let guard = server.tracker.track();
                        let connection_id = guard.id();
                        if let Err(e) = tcp.set_nodelay(true) {
                            tracing::debug!(connection_id = %connection_id, error = %e, "set_nodelay failed");
                        }
                        let stream = match server.tls.as_ref() {
                            None => MaybeTlsStream::Plain(tcp),
                            Some(acceptor) => {
                                let handshake = with_timeout(
                                    "TLS handshake",
                                    server.deadlines.connect,
                                    acceptor.accept(tcp),
                                );
                                match handshake.await {
                                    Ok(Ok(tls)) => MaybeTlsStream::ServerTls(Box::new(tls)),
                                    Ok(Err(e)) => {
                                        tracing::debug!(connection_id = %connection_id, peer_addr = %peer_addr, error = %e, "TLS handshake failed");
                                        return;
                                    }
                                    Err(e) => {
                                        tracing::debug!(connection_id = %connection_id, peer_addr = %peer_addr, error = %e, "TLS handshake abandoned");
                                        return;
                                    }
                                }
                            }
                        };
                        let info = ConnectionInfo {
                            peer_addr,
                            tls: stream.is_tls(),
                        };
                        server.serve_connection(stream, info, connection_id, ClientEof::Abort).await;
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("HTTP listener stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Serve one connection until it closes. `on_eof` decides whether a
    /// read-side EOF during a handler aborts it.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        info: ConnectionInfo,
        connection_id: ConnectionId,
        on_eof: ClientEof,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tracing::trace!(connection_id = %connection_id, peer_addr = %info.peer_addr, "Serving connection");
        let (mut reader, writer) = tokio::io::split(stream);
        let mut downstream = Downstream::new(Box::new(writer));
        let mut parser = RequestParser::new(info, self.limits);
        let mut mode = ConnectionMode::ParsingHttp;
        let mut block = vec![0u8; READ_BLOCK];

        'connection: loop {
            match &mut mode {
                ConnectionMode::ParsingHttp => loop {
                    let request = match parser.next_request().await {
                        Ok(Some(request)) => request,
                        Ok(None) => break,
                        Err(e) => {
                            self.reject(&mut downstream, connection_id, e).await;
                            return;
                        }
                    };
                    let mut watch = ClientWatch {
                        reader: &mut reader,
                        parser: &mut parser,
                        block: &mut block,
                        on_eof,
                        eof: false,
                    };
                    match self.dispatch(request, &mut downstream, &mut watch, connection_id).await {
                        AfterResponse::KeepAlive => continue,
                        AfterResponse::Close => {
                            let _ = downstream.shutdown().await;
                            return;
                        }
                        AfterResponse::Upgrade(handler) => {
                            tracing::debug!(connection_id = %connection_id, "Connection upgraded");
                            // Bytes pipelined behind the upgrade request
                            // belong to the new protocol.
                            mode = ConnectionMode::Upgraded(handler);
                            continue 'connection;
                        }
                    }
                },
                ConnectionMode::Upgraded(handler) => {
                    let mut output = Vec::new();
                    let status = loop {
                        match handler.on_data(parser.buffer_mut(), &mut output) {
                            UpgradeStatus::Handled => continue,
                            other => break other,
                        }
                    };
                    if !output.is_empty() && downstream.write_all(&output).await.is_err() {
                        handler.on_close();
                        return;
                    }
                    let _ = downstream.flush().await;
                    if status == UpgradeStatus::Close {
                        handler.on_close();
                        let _ = downstream.shutdown().await;
                        return;
                    }
                }
            }

            let read = if parser.is_idle() && matches!(mode, ConnectionMode::ParsingHttp) {
                match with_timeout("idle read", self.deadlines.idle, reader.read(&mut block)).await {
                    Ok(read) => read,
                    Err(e) => {
                        tracing::trace!(connection_id = %connection_id, error = %e, "Idle connection closed");
                        let _ = downstream.shutdown().await;
                        return;
                    }
                }
            } else {
                reader.read(&mut block).await
            };

            let n = match read {
                Ok(0) | Err(_) => {
                    if let ConnectionMode::Upgraded(handler) = &mut mode {
                        handler.on_close();
                    }
                    return;
                }
                Ok(n) => n,
            };

            if let Err(ParseError::BufferOverflow { capacity }) = parser.feed(&block[..n]) {
                tracing::warn!(
                    connection_id = %connection_id,
                    peer_addr = %info.peer_addr,
                    capacity,
                    "Receive buffer overflow, closing connection"
                );
                metrics::record_buffer_overflow();
                if let ConnectionMode::Upgraded(handler) = &mut mode {
                    handler.on_close();
                }
                let _ = downstream.shutdown().await;
                return;
            }
        }
    }

    /// Answer a request that could not be parsed, then close.
    async fn reject(&self, downstream: &mut Downstream, connection_id: ConnectionId, error: ParseError) {
        let (status, body) = match &error {
            ParseError::UnsupportedTransferEncoding => {
                (StatusCode::NOT_IMPLEMENTED, "Chunked request bodies are not supported")
            }
            ParseError::Spool(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            _ => (StatusCode::BAD_REQUEST, "Bad Request"),
        };
        tracing::warn!(connection_id = %connection_id, error = %error, status = status.as_u16(), "Rejecting request");

        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            body.len()
        )
        .into_bytes();
        head.extend_from_slice(body.as_bytes());
        let _ = downstream.write_all(&head).await;
        let _ = downstream.flush().await;
        let _ = downstream.shutdown().await;
    }

    async fn dispatch<R: AsyncRead + Unpin>(
        &self,
        request: Request,
        downstream: &mut Downstream,
        watch: &mut ClientWatch<'_, R>,
        connection_id: ConnectionId,
    ) -> AfterResponse {
        let started = Instant::now();
        let keep_alive = request.keep_alive();
        let written_before = downstream.bytes_written();

        let outcome = match self.routes.resolve(&request.host, &request.path) {
            None => HandlerOutcome::NoMatch,
            Some(route) => {
                let mut ctx = RequestContext {
                    request: &request,
                    short_path: &route.short_path,
                    downstream: &mut *downstream,
                };
                let invocation = with_timeout(
                    "request",
                    self.deadlines.request,
                    AssertUnwindSafe(route.handler.invoke(&mut ctx)).catch_unwind(),
                );
                tokio::select! {
                    biased;
                    result = invocation => match result {
                        Err(timeout) => HandlerOutcome::TimedOut(timeout),
                        Ok(Err(panic)) => HandlerOutcome::Failed(Error::handler(panic_message(panic))),
                        Ok(Ok(Err(e))) => HandlerOutcome::Failed(e),
                        Ok(Ok(Ok(Some(response)))) => HandlerOutcome::Response(response),
                        Ok(Ok(Ok(None))) => HandlerOutcome::NoMatch,
                    },
                    event = watch.disconnected() => HandlerOutcome::Disconnected(event),
                }
            }
        };
        let response_started = downstream.bytes_written() > written_before;

        let mut response = match outcome {
            HandlerOutcome::Response(response) => response,
            HandlerOutcome::NoMatch => Response::text(StatusCode::NOT_FOUND, "Not Found"),
            HandlerOutcome::Failed(error) => {
                tracing::error!(
                    connection_id = %connection_id,
                    request_id = %request.request_id,
                    method = %request.method,
                    path = %request.path,
                    error = %error,
                    "Handler failed"
                );
                if response_started {
                    return AfterResponse::Close;
                }
                let body = if request.connection.is_private_peer() {
                    format!("{:?}", error)
                } else {
                    error.to_string()
                };
                Response::text(StatusCode::INTERNAL_SERVER_ERROR, body)
            }
            HandlerOutcome::Disconnected(ClientEvent::Closed) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    request_id = %request.request_id,
                    path = %request.path,
                    "Client disconnected, handler dropped"
                );
                return AfterResponse::Close;
            }
            HandlerOutcome::Disconnected(ClientEvent::Overflow { capacity }) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    peer_addr = %request.connection.peer_addr,
                    capacity,
                    "Receive buffer overflow, closing connection"
                );
                metrics::record_buffer_overflow();
                return AfterResponse::Close;
            }
            HandlerOutcome::TimedOut(timeout) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    request_id = %request.request_id,
                    path = %request.path,
                    error = %timeout,
                    "Request timed out"
                );
                if response_started {
                    return AfterResponse::Close;
                }
                Response::text(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
            }
        };

        if !keep_alive && !response.finished {
            response.headers.set("Connection", "close");
        }
        let keep_alive = keep_alive && !response.headers.has_token("connection", "close");
        let status = response.status;

        match self.pipeline.send(downstream, &request, response, started).await {
            Ok(Some(handler)) => AfterResponse::Upgrade(handler),
            Ok(None) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    request_id = %request.request_id,
                    method = %request.method,
                    path = %request.path,
                    status = status.as_u16(),
                    "Request completed"
                );
                if keep_alive {
                    AfterResponse::KeepAlive
                } else {
                    AfterResponse::Close
                }
            }
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Failed to write response");
                AfterResponse::Close
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::handler::RouteHandler;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn server(config: ServerConfig) -> Arc<HttpServer> {
        let routes = Arc::new(RouteTable::new("localhost"));
        routes.add(
            None,
            "/hello",
            RouteHandler::sync(|_, _| Ok(Some(Response::text(StatusCode::OK, "hi")))),
        );
        routes.add(
            None,
            "/fail",
            RouteHandler::sync(|_, _| Err(Error::handler("boom"))),
        );
        routes.add(
            None,
            "/panic",
            RouteHandler::sync(|_, _| panic!("kaboom")),
        );
        Arc::new(HttpServer::new(&config, routes, None))
    }

    fn connect_with(server: Arc<HttpServer>, on_eof: ClientEof) -> DuplexStream {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let info = ConnectionInfo {
            peer_addr: "127.0.0.1:5555".parse().unwrap(),
            tls: false,
        };
        tokio::spawn(async move {
            server
                .serve_connection(server_side, info, ConnectionId::new(), on_eof)
                .await;
        });
        client
    }

    fn connect(server: Arc<HttpServer>) -> DuplexStream {
        connect_with(server, ClientEof::Abort)
    }

    async fn exchange(server: Arc<HttpServer>, raw: &[u8]) -> String {
        let mut client = connect(server);
        client.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn pipelined_requests_answered_in_order() {
        let out = exchange(
            server(ServerConfig::default()),
            b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\nGET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        let first = out.find("200 OK").unwrap();
        let second = out.find("404 Not Found").unwrap();
        assert!(first < second);
        assert!(out.contains("Connection: close"));
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_500() {
        let out = exchange(
            server(ServerConfig::default()),
            b"GET /fail HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 500"));
        assert!(out.contains("boom"));

        let out = exchange(
            server(ServerConfig::default()),
            b"GET /panic HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 500"));
        assert!(out.contains("kaboom"));
    }

    #[tokio::test]
    async fn chunked_request_body_gets_501_and_close() {
        let out = exchange(
            server(ServerConfig::default()),
            b"POST /hello HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 501"));
    }

    #[tokio::test]
    async fn overflow_closes_without_response() {
        let mut config = ServerConfig::default();
        config.http.receive_buffer_bytes = 256;
        let mut client = connect(server(config));
        let mut raw = b"GET /hello HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(1024));
        let _ = client.write_all(&raw).await;
        let mut out = Vec::new();
        let _ = client.read_to_end(&mut out).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn slow_handler_times_out_with_504() {
        let mut config = ServerConfig::default();
        config.timeouts.request_secs = 1;
        let server = server(config);

        struct Slow;
        #[async_trait::async_trait]
        impl crate::routing::handler::Handler for Slow {
            async fn handle(&self, _ctx: &mut RequestContext<'_>) -> Result<Option<Response>> {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                Ok(None)
            }
        }
        server.routes().add(None, "/slow", RouteHandler::from_handler(Slow));

        let out = exchange(server, b"GET /slow HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 504"));
    }

    /// Sleeps long past any test deadline, recording start and drop.
    struct Stuck {
        started: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl crate::routing::handler::Handler for Stuck {
        async fn handle(&self, _ctx: &mut RequestContext<'_>) -> Result<Option<Response>> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    async fn wait_for(flag: &AtomicBool) {
        for _ in 0..200 {
            if flag.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("flag never set");
    }

    #[tokio::test]
    async fn client_disconnect_drops_running_handler() {
        let mut config = ServerConfig::default();
        config.timeouts.request_secs = 60;
        let server = server(config);
        let started = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        server.routes().add(
            None,
            "/stuck",
            RouteHandler::from_handler(Stuck {
                started: Arc::clone(&started),
                dropped: Arc::clone(&dropped),
            }),
        );

        let mut client = connect(server);
        client.write_all(b"GET /stuck HTTP/1.1\r\n\r\n").await.unwrap();
        wait_for(&started).await;
        assert!(!dropped.load(Ordering::SeqCst));

        drop(client);
        wait_for(&dropped).await;
    }

    #[tokio::test]
    async fn half_closed_client_still_gets_response() {
        let server = server(ServerConfig::default());
        server.routes().add(
            None,
            "/late",
            RouteHandler::from_handler(Late),
        );

        struct Late;
        #[async_trait::async_trait]
        impl crate::routing::handler::Handler for Late {
            async fn handle(&self, _ctx: &mut RequestContext<'_>) -> Result<Option<Response>> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Some(Response::text(StatusCode::OK, "late")))
            }
        }

        let mut client = connect_with(server, ClientEof::HalfClose);
        client.write_all(b"GET /late HTTP/1.1\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8_lossy(&out);
        assert!(out.starts_with("HTTP/1.1 200"));
        assert!(out.ends_with("late"));
    }

    #[tokio::test]
    async fn bytes_pipelined_during_handler_are_served_next() {
        let server = server(ServerConfig::default());
        server.routes().add(
            None,
            "/wait",
            RouteHandler::from_handler(Wait),
        );

        struct Wait;
        #[async_trait::async_trait]
        impl crate::routing::handler::Handler for Wait {
            async fn handle(&self, _ctx: &mut RequestContext<'_>) -> Result<Option<Response>> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Some(Response::text(StatusCode::OK, "first")))
            }
        }

        let mut client = connect(server);
        client.write_all(b"GET /wait HTTP/1.1\r\n\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client
            .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8_lossy(&out);
        let first = out.find("\r\n\r\nfirst").unwrap();
        let second = out.find("\r\n\r\nhi").unwrap();
        assert!(first < second);
    }
}
