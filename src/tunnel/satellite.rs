//! Satellite side of the tunnel.
//!
//! # Responsibilities
//! - Dial the primary (optionally over TLS), authenticate, and advertise every
//!   route in the local table
//! - Turn each ConnectVirtualClient into a [`VirtualStream`] served by the
//!   local [`HttpServer`] exactly like an accepted socket
//! - Feed `Data` frames to the matching shim; close it on Disconnect
//! - Reconnect with exponential backoff whenever the link drops

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::SatelliteConfig;
use crate::error::{Error, Result};
use crate::http::request::ConnectionInfo;
use crate::http::server::{ClientEof, HttpServer};
use crate::net::connection::ConnectionId;
use crate::net::tls;
use crate::resilience::backoff::Backoff;
use crate::tunnel::frame::{Frame, FrameCodec, HandlerKind, Side};
use crate::tunnel::shim::{ShimHandle, VirtualStream};

const OUTBOUND_QUEUE: usize = 256;

/// How a tunnel session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Closed,
    /// The primary sent an Error frame before closing.
    Rejected(String),
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Satellite {
    config: SatelliteConfig,
    server: Arc<HttpServer>,
    max_frame_size: usize,
    connect_timeout: Duration,
    connector: TlsConnector,
}

impl Satellite {
    pub fn new(config: SatelliteConfig, server: Arc<HttpServer>, max_frame_size: usize, connect_timeout: Duration) -> Self {
        Self {
            config,
            server,
            max_frame_size,
            connect_timeout,
            connector: tls::client_connector(),
        }
    }

    /// Keep a tunnel to the primary open until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.config.reconnect_base_ms, self.config.reconnect_max_ms);
        loop {
            let outcome = tokio::select! {
                outcome = self.connect_once() => outcome,
                _ = shutdown.recv() => {
                    tracing::info!("Satellite stopping");
                    return;
                }
            };
            match outcome {
                Ok(SessionEnd::Closed) => {
                    tracing::info!(primary = %self.config.primary_address, "Tunnel to primary closed");
                    backoff.reset();
                }
                Ok(SessionEnd::Rejected(reason)) => {
                    tracing::warn!(primary = %self.config.primary_address, reason = %reason, "Primary rejected tunnel");
                }
                Err(e) => {
                    tracing::warn!(primary = %self.config.primary_address, error = %e, "Tunnel connection failed");
                }
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                primary = %self.config.primary_address,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to primary"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Satellite stopping");
                    return;
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<SessionEnd> {
        let (host, port) = split_address(&self.config.primary_address)?;
        let server_name = self
            .config
            .server_name
            .clone()
            .unwrap_or_else(|| host.to_string());
        let tls = self.config.tls.then(|| (&self.connector, server_name.as_str()));
        let stream = tls::dial(host, port, tls, self.connect_timeout).await?;
        tracing::info!(primary = %self.config.primary_address, tls = self.config.tls, "Connected to primary");
        self.drive(stream).await
    }

    /// Run one tunnel session over an established stream.
    pub async fn drive<S>(&self, stream: S) -> Result<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, FrameCodec::new(Side::Satellite, self.max_frame_size));
        let (outbound, mut queue) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);

        let max_frame_size = self.max_frame_size;
        let _writer = AbortOnDrop(tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, FrameCodec::new(Side::Satellite, max_frame_size));
            while let Some(frame) = queue.recv().await {
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(error = %e, "Tunnel write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        }));

        let closed = || Error::handler("tunnel writer closed");
        outbound
            .send(Frame::Authenticate {
                secret: self.config.secret.clone(),
            })
            .await
            .map_err(|_| closed())?;
        let routes = self.server.routes().routes();
        for (domain, path) in &routes {
            outbound
                .send(Frame::RegisterRoute {
                    domain: domain.clone(),
                    path: path.clone(),
                })
                .await
                .map_err(|_| closed())?;
        }
        tracing::info!(routes = routes.len(), "Advertised routes to primary");

        let shims: Arc<DashMap<u64, ShimHandle>> = Arc::new(DashMap::new());
        let mut rejected = None;
        let result = loop {
            let frame = match frames.next().await {
                None => break Ok(()),
                Some(Err(e)) => break Err(Error::from(e)),
                Some(Ok(frame)) => frame,
            };
            match frame {
                Frame::Connect { client_id, kind, peer } => {
                    self.open_client(client_id, kind, &peer, &outbound, &shims);
                }
                Frame::Data { client_id, payload } => match shims.get_mut(&client_id) {
                    Some(mut shim) => {
                        shim.push(payload);
                    }
                    None => tracing::debug!(client_id, "Data for unknown virtual client"),
                },
                Frame::Disconnect { client_id } => {
                    if let Some((_, mut shim)) = shims.remove(&client_id) {
                        shim.close();
                    }
                }
                Frame::Error { message } => {
                    tracing::warn!(message = %message, "Primary reported error");
                    rejected = Some(message);
                }
                other => {
                    tracing::debug!(frame = ?other, "Ignoring unexpected frame from primary");
                }
            }
        };

        for mut shim in shims.iter_mut() {
            shim.value_mut().close();
        }
        shims.clear();

        result?;
        Ok(match rejected {
            Some(reason) => SessionEnd::Rejected(reason),
            None => SessionEnd::Closed,
        })
    }

    fn open_client(
        &self,
        client_id: u64,
        kind: HandlerKind,
        peer: &str,
        outbound: &mpsc::Sender<Frame>,
        shims: &Arc<DashMap<u64, ShimHandle>>,
    ) {
        let (stream, handle) = VirtualStream::new(
            client_id,
            outbound.clone(),
            FrameCodec::max_data_payload(self.max_frame_size),
        );
        shims.insert(client_id, handle);
        let info = ConnectionInfo {
            peer_addr: peer
                .parse()
                .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            tls: kind == HandlerKind::Https,
        };
        tracing::trace!(client_id, peer_addr = %info.peer_addr, "Virtual client connected");

        let server = Arc::clone(&self.server);
        let outbound = outbound.clone();
        let shims = Arc::clone(shims);
        tokio::spawn(async move {
            // The end-of-request marker reads as EOF; the client is still there.
            server
                .serve_connection(stream, info, ConnectionId::new(), ClientEof::HalfClose)
                .await;
            shims.remove(&client_id);
            let _ = outbound.send(Frame::end_of_stream(client_id)).await;
            tracing::trace!(client_id, "Virtual client finished");
        });
    }
}

fn split_address(address: &str) -> Result<(&str, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::handler(format!("primary address '{}' has no port", address)))?;
    let port = port
        .parse()
        .map_err(|_| Error::handler(format!("primary address '{}' has an invalid port", address)))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::http::response::Response;
    use crate::routing::handler::RouteHandler;
    use crate::routing::table::RouteTable;
    use bytes::Bytes;
    use http::StatusCode;

    const MAX_FRAME: usize = 64 * 1024;

    fn satellite() -> Satellite {
        let routes = Arc::new(RouteTable::new("x.com"));
        routes.add(
            None,
            "/api/*",
            RouteHandler::sync(|req, short| {
                let scheme = req.connection.scheme();
                Ok(Some(Response::text(StatusCode::OK, format!("{} {}", scheme, short))))
            }),
        );
        let server = Arc::new(HttpServer::new(&ServerConfig::default(), routes, None));
        let config = SatelliteConfig {
            enabled: true,
            primary_address: "127.0.0.1:1".into(),
            secret: "s3cret".into(),
            ..SatelliteConfig::default()
        };
        Satellite::new(config, server, MAX_FRAME, Duration::from_secs(1))
    }

    #[test]
    fn primary_address_parsing() {
        assert_eq!(split_address("primary.example:8443").unwrap(), ("primary.example", 8443));
        assert_eq!(split_address("[::1]:9000").unwrap(), ("::1", 9000));
        assert!(split_address("nohost").is_err());
    }

    #[tokio::test]
    async fn serves_virtual_client_through_local_routes() {
        let sat = satellite();
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        let session = tokio::spawn(async move { sat.drive(theirs).await });

        let (r, w) = tokio::io::split(ours);
        let mut frames = FramedRead::new(r, FrameCodec::new(Side::Primary, MAX_FRAME));
        let mut sink = FramedWrite::new(w, FrameCodec::new(Side::Primary, MAX_FRAME));

        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::Authenticate { secret: "s3cret".into() }
        );
        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::RegisterRoute { domain: "x.com".into(), path: "api/*".into() }
        );

        sink.send(Frame::Connect { client_id: 5, kind: HandlerKind::Https, peer: "203.0.113.9:4000".into() })
            .await
            .unwrap();
        sink.send(Frame::Data {
            client_id: 5,
            payload: Bytes::from_static(b"GET /api/ping HTTP/1.1\r\nHost: x.com\r\n\r\n"),
        })
        .await
        .unwrap();
        sink.send(Frame::end_of_stream(5)).await.unwrap();

        let mut response = Vec::new();
        loop {
            match frames.next().await.unwrap().unwrap() {
                Frame::Data { client_id: 5, payload } if payload.is_empty() => break,
                Frame::Data { client_id: 5, payload } => response.extend_from_slice(&payload),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("https ping"));

        drop(frames);
        drop(sink);
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Closed);
    }
}
