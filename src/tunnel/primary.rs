//! Primary side of the tunnel.
//!
//! # Responsibilities
//! - Accept satellite connections and authenticate them against the
//!   [`KeyRegistry`]
//! - Register the routes a satellite advertises, within its key's scope,
//!   against a [`ForwardingHandler`]
//! - Route `Data` frames into the mailbox of their virtual client
//! - On disconnect, remove the session's routes and terminate every open
//!   mailbox
//!
//! # Design Decisions
//! - One writer task per session owns the socket write half; everything else
//!   sends whole frames through a bounded channel
//! - Mailbox cleanup lives in `Drop`, so it runs on every exit path including
//!   request timeouts and downstream disconnects

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{Error, Result};
use crate::http::response::Response;
use crate::observability::metrics;
use crate::routing::handler::{Handler, RequestContext, RouteHandler};
use crate::routing::table::{RouteOwner, RouteTable};
use crate::tunnel::auth::{KeyRegistry, Scope};
use crate::tunnel::frame::{Frame, FrameCodec, HandlerKind, Side};
use crate::tunnel::mailbox::MailboxTable;

const OUTBOUND_QUEUE: usize = 256;
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub struct TunnelServer {
    routes: Arc<RouteTable>,
    keys: Arc<KeyRegistry>,
    max_frame_size: usize,
    next_session: AtomicU64,
}

impl TunnelServer {
    pub fn new(routes: Arc<RouteTable>, keys: Arc<KeyRegistry>, max_frame_size: usize) -> Self {
        Self {
            routes,
            keys,
            max_frame_size,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn keys(&self) -> &Arc<KeyRegistry> {
        &self.keys
    }

    /// Accept satellite connections until shutdown is signalled.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Tunnel accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.serve_session(stream, peer_addr).await;
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("Tunnel listener stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drive one satellite connection until it closes.
    pub async fn serve_session<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let owner: RouteOwner = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, FrameCodec::new(Side::Primary, self.max_frame_size));
        let (outbound, mut queue) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);

        let max_frame_size = self.max_frame_size;
        let mut writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, FrameCodec::new(Side::Primary, max_frame_size));
            while let Some(frame) = queue.recv().await {
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(error = %e, "Tunnel write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tracing::debug!(session = owner, peer_addr = %peer_addr, "Tunnel session opened");
        metrics::record_tunnel_sessions(1.0);

        let mut session = Session {
            owner,
            peer_addr,
            scope: None,
            registered: Vec::new(),
            mailboxes: Arc::new(MailboxTable::new()),
            outbound,
            max_payload: FrameCodec::max_data_payload(self.max_frame_size),
        };

        while let Some(next) = frames.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(session = owner, peer_addr = %peer_addr, error = %e, "Tunnel framing error, closing");
                    break;
                }
            };
            if !self.handle_frame(&mut session, frame).await {
                break;
            }
        }

        self.close_session(session);
        drop(frames);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
        metrics::record_tunnel_sessions(-1.0);
        tracing::debug!(session = owner, peer_addr = %peer_addr, "Tunnel session closed");
    }

    /// Returns false when the session must be closed.
    async fn handle_frame(&self, session: &mut Session, frame: Frame) -> bool {
        match frame {
            Frame::Authenticate { secret } => match self.keys.authenticate(&secret) {
                Some(scope) => {
                    tracing::info!(session = session.owner, peer_addr = %session.peer_addr, "Tunnel authenticated");
                    session.scope = Some(scope);
                    true
                }
                None => {
                    tracing::warn!(session = session.owner, peer_addr = %session.peer_addr, "Tunnel authentication failed");
                    session.send_error("authentication failed").await;
                    false
                }
            },
            _ if session.scope.is_none() => {
                session.send_error("not authenticated").await;
                true
            }
            Frame::RegisterRoute { domain, path } => {
                self.register(session, domain, path).await;
                true
            }
            Frame::Data { client_id, payload } => {
                if !session.mailboxes.deliver(client_id, payload) {
                    tracing::debug!(session = session.owner, client_id, "Data for unknown virtual client");
                }
                true
            }
            Frame::Disconnect { client_id } => {
                session.mailboxes.deliver(client_id, Bytes::new());
                true
            }
            Frame::Error { message } => {
                tracing::warn!(session = session.owner, message = %message, "Satellite reported error");
                true
            }
            Frame::Connect { .. } => {
                session.send_error("unexpected command").await;
                true
            }
        }
    }

    async fn register(&self, session: &mut Session, domain: String, path: String) {
        let domain = domain.to_ascii_lowercase();
        let allowed = session.scope.as_ref().map(|s| s.allows(&domain)).unwrap_or(false);
        if !allowed {
            tracing::warn!(session = session.owner, domain = %domain, "Tunnel route outside key scope");
            session.send_error(&format!("domain not allowed: {}", domain)).await;
            return;
        }
        let handler = ForwardingHandler {
            outbound: session.outbound.clone(),
            mailboxes: Arc::clone(&session.mailboxes),
            max_payload: session.max_payload,
        };
        self.routes
            .add_owned(&domain, &path, RouteHandler::from_handler(handler), session.owner);
        tracing::info!(session = session.owner, domain = %domain, path = %path, "Tunnel route registered");
        session.registered.push((domain, path));
    }

    fn close_session(&self, session: Session) {
        for (domain, path) in &session.registered {
            if self.routes.remove_if_owned(domain, path, session.owner) {
                tracing::info!(session = session.owner, domain = %domain, path = %path, "Tunnel route unregistered");
            }
        }
        let terminated = session.mailboxes.close();
        if terminated > 0 {
            tracing::debug!(session = session.owner, terminated, "Terminated open virtual clients");
        }
    }
}

struct Session {
    owner: RouteOwner,
    peer_addr: SocketAddr,
    scope: Option<Scope>,
    registered: Vec<(String, String)>,
    mailboxes: Arc<MailboxTable>,
    outbound: mpsc::Sender<Frame>,
    max_payload: usize,
}

impl Session {
    async fn send_error(&self, message: &str) {
        let _ = self
            .outbound
            .send(Frame::Error {
                message: message.to_string(),
            })
            .await;
    }
}

/// Route handler that relays a request to the satellite as a virtual client.
pub struct ForwardingHandler {
    outbound: mpsc::Sender<Frame>,
    mailboxes: Arc<MailboxTable>,
    max_payload: usize,
}

impl ForwardingHandler {
    async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::handler("tunnel connection closed"))
    }
}

#[async_trait]
impl Handler for ForwardingHandler {
    async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<Option<Response>> {
        let request = ctx.request;
        let mut mailbox = self.mailboxes.open(self.outbound.clone());
        let client_id = mailbox.id();
        let kind = if request.connection.tls {
            HandlerKind::Https
        } else {
            HandlerKind::Http
        };

        self.send(Frame::Connect {
            client_id,
            kind,
            peer: request.connection.peer_addr.to_string(),
        })
        .await?;
        self.send(Frame::Data {
            client_id,
            payload: Bytes::from(request.head_bytes()),
        })
        .await?;
        if !request.body.is_empty() {
            let mut body = request.body.reader().await?;
            let mut block = vec![0u8; self.max_payload];
            loop {
                let n = body.read(&mut block).await?;
                if n == 0 {
                    break;
                }
                self.send(Frame::Data {
                    client_id,
                    payload: Bytes::copy_from_slice(&block[..n]),
                })
                .await?;
            }
        }
        self.send(Frame::end_of_stream(client_id)).await?;

        let mut status = None;
        while let Some(chunk) = mailbox.recv().await {
            if status.is_none() {
                status = Some(status_of(&chunk));
            }
            if let Err(e) = ctx.downstream.write_all(&chunk).await {
                tracing::debug!(client_id, error = %e, "Downstream gone during tunnel relay");
                return Err(e.into());
            }
        }
        ctx.downstream.flush().await?;

        match status {
            Some(status) => Ok(Some(Response::finished(status))),
            None => Err(Error::handler("satellite closed virtual client without a response")),
        }
    }
}

/// Status code from the first relayed bytes, for logging and metrics.
fn status_of(first_chunk: &[u8]) -> StatusCode {
    first_chunk
        .get(9..12)
        .filter(|_| first_chunk.starts_with(b"HTTP/1."))
        .and_then(|code| std::str::from_utf8(code).ok())
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelKeyConfig;
    use crate::http::pipeline::Downstream;
    use crate::http::request::test_support::request;
    use http::Method;
    use tokio::io::DuplexStream;

    const MAX_FRAME: usize = 64 * 1024;

    struct Satellite {
        frames: FramedRead<tokio::io::ReadHalf<DuplexStream>, FrameCodec>,
        sink: FramedWrite<tokio::io::WriteHalf<DuplexStream>, FrameCodec>,
    }

    impl Satellite {
        async fn send(&mut self, frame: Frame) {
            self.sink.send(frame).await.unwrap();
        }

        async fn next(&mut self) -> Option<Frame> {
            self.frames.next().await.map(|f| f.unwrap())
        }
    }

    fn start(routes: Arc<RouteTable>, keys: &[TunnelKeyConfig]) -> Satellite {
        let server = Arc::new(TunnelServer::new(routes, Arc::new(KeyRegistry::new(keys)), MAX_FRAME));
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        tokio::spawn(async move {
            server.serve_session(theirs, "127.0.0.1:7000".parse().unwrap()).await;
        });
        let (r, w) = tokio::io::split(ours);
        Satellite {
            frames: FramedRead::new(r, FrameCodec::new(Side::Satellite, MAX_FRAME)),
            sink: FramedWrite::new(w, FrameCodec::new(Side::Satellite, MAX_FRAME)),
        }
    }

    fn keys() -> Vec<TunnelKeyConfig> {
        vec![TunnelKeyConfig {
            secret: "s3cret".into(),
            domains: vec!["x.com".into()],
        }]
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn wrong_secret_gets_error_and_close() {
        let routes = Arc::new(RouteTable::new("localhost"));
        let mut sat = start(routes, &keys());
        sat.send(Frame::Authenticate { secret: "nope".into() }).await;
        assert_eq!(
            sat.next().await,
            Some(Frame::Error {
                message: "authentication failed".into()
            })
        );
        assert_eq!(sat.next().await, None);
    }

    #[tokio::test]
    async fn registration_requires_auth_and_scope() {
        let routes = Arc::new(RouteTable::new("localhost"));
        let mut sat = start(Arc::clone(&routes), &keys());

        sat.send(Frame::RegisterRoute { domain: "x.com".into(), path: "api/*".into() }).await;
        assert_eq!(sat.next().await, Some(Frame::Error { message: "not authenticated".into() }));

        sat.send(Frame::Authenticate { secret: "s3cret".into() }).await;
        sat.send(Frame::RegisterRoute { domain: "y.com".into(), path: "api/*".into() }).await;
        assert_eq!(sat.next().await, Some(Frame::Error { message: "domain not allowed: y.com".into() }));

        sat.send(Frame::RegisterRoute { domain: "x.com".into(), path: "api/*".into() }).await;
        let r = Arc::clone(&routes);
        wait_for(move || r.resolve("x.com", "/api/ping").is_some()).await;
        assert!(routes.has_domain("x.com"));
    }

    #[tokio::test]
    async fn interleaved_data_reaches_each_client_in_order() {
        let routes = Arc::new(RouteTable::new("localhost"));
        let mut sat = start(Arc::clone(&routes), &keys());
        sat.send(Frame::Authenticate { secret: "s3cret".into() }).await;
        sat.send(Frame::RegisterRoute { domain: "x.com".into(), path: "api/*".into() }).await;
        let r = Arc::clone(&routes);
        wait_for(move || r.resolve("x.com", "/api/a").is_some()).await;

        let spawn_client = |path: &'static str| {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let route = routes.resolve("x.com", path).unwrap();
                let req = request(Method::GET, path, &[("Host", "x.com")]);
                let (mut client, server_side) = tokio::io::duplex(64 * 1024);
                let mut downstream = Downstream::new(Box::new(server_side));
                let mut ctx = RequestContext {
                    request: &req,
                    short_path: &route.short_path,
                    downstream: &mut downstream,
                };
                let response = route.handler.invoke(&mut ctx).await.unwrap().unwrap();
                assert!(response.finished);
                drop(downstream);
                let mut out = String::new();
                client.read_to_string(&mut out).await.unwrap();
                out
            })
        };
        let a = spawn_client("/api/a");
        let b = spawn_client("/api/b");

        // Learn both client ids from their Connect frames and drain the uploads.
        let mut ids = Vec::new();
        while ids.len() < 2 {
            match sat.next().await {
                Some(Frame::Data { client_id, payload }) if !payload.is_empty() => {
                    let head = String::from_utf8(payload.to_vec()).unwrap();
                    let path = if head.contains("/api/a") { "a" } else { "b" };
                    ids.push((path, client_id));
                }
                Some(_) => {}
                None => panic!("tunnel closed"),
            }
        }
        let id_of = |p: &str| ids.iter().find(|(n, _)| *n == p).map(|(_, id)| *id).unwrap();
        let (ida, idb) = (id_of("a"), id_of("b"));

        for (id, part) in [
            (ida, "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n"),
            (idb, "HTTP/1.1 201 Created\r\nContent-Length: 4\r\n\r\n"),
            (ida, "A1"),
            (idb, "B1"),
            (idb, "B2"),
            (ida, "A2"),
        ] {
            sat.send(Frame::Data { client_id: id, payload: Bytes::from(part) }).await;
        }
        sat.send(Frame::end_of_stream(ida)).await;
        sat.send(Frame::end_of_stream(idb)).await;

        assert_eq!(a.await.unwrap(), "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nA1A2");
        assert_eq!(b.await.unwrap(), "HTTP/1.1 201 Created\r\nContent-Length: 4\r\n\r\nB1B2");
    }

    #[tokio::test]
    async fn disconnect_terminates_clients_and_removes_routes() {
        let routes = Arc::new(RouteTable::new("localhost"));
        let mut sat = start(Arc::clone(&routes), &keys());
        sat.send(Frame::Authenticate { secret: "s3cret".into() }).await;
        sat.send(Frame::RegisterRoute { domain: "x.com".into(), path: "api/*".into() }).await;
        let r = Arc::clone(&routes);
        wait_for(move || r.resolve("x.com", "/api/a").is_some()).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            let routes = Arc::clone(&routes);
            clients.push(tokio::spawn(async move {
                let route = routes.resolve("x.com", "/api/a").unwrap();
                let req = request(Method::GET, "/api/a", &[("Host", "x.com")]);
                let mut downstream = Downstream::new(Box::new(tokio::io::sink()));
                let mut ctx = RequestContext {
                    request: &req,
                    short_path: &route.short_path,
                    downstream: &mut downstream,
                };
                route.handler.invoke(&mut ctx).await
            }));
        }
        // Three Connect frames, each followed by the head and upload end.
        let mut connects = 0;
        while connects < 3 {
            if let Some(Frame::Connect { .. }) = sat.next().await {
                connects += 1;
            }
        }
        drop(sat);

        for client in clients {
            assert!(client.await.unwrap().is_err());
        }
        let r = Arc::clone(&routes);
        wait_for(move || r.resolve("x.com", "/api/a").is_none()).await;
    }

    #[test]
    fn status_parsed_from_relayed_head() {
        assert_eq!(status_of(b"HTTP/1.1 404 Not Found\r\n"), StatusCode::NOT_FOUND);
        assert_eq!(status_of(b"garbage"), StatusCode::OK);
    }
}
