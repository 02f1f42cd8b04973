//! Upstream connection pool.
//!
//! # Responsibilities
//! - Keep idle upstream connections keyed by (host, port, tls)
//! - Hand out an idle connection or dial a new one (TLS handshake included)
//! - Take connections back unless they were flagged non-reusable
//! - Evict idle connections past their timeout, lazily on checkout
//!
//! # Design Decisions
//! - One mutex guards bookkeeping only; dialing and all socket I/O happen
//!   outside it
//! - A checked-out connection is owned exclusively by one request; dropping
//!   it without `release` closes it

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsConnector;

use crate::error::Result;
use crate::net::stream::MaybeTlsStream;
use crate::net::tls;
use crate::observability::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

struct IdleConnection {
    id: u64,
    stream: MaybeTlsStream,
    last_activity: Instant,
}

/// A connection checked out of the pool.
pub struct PooledConnection {
    id: u64,
    key: PoolKey,
    stream: MaybeTlsStream,
    reused: bool,
    reusable: bool,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("reused", &self.reused)
            .field("reusable", &self.reusable)
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// True if this connection came from the idle list.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// A non-reusable connection is closed by `release` instead of pooled.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

pub struct ConnectionPool {
    idle: Mutex<HashMap<PoolKey, Vec<IdleConnection>>>,
    idle_timeout: Duration,
    connect_timeout: Duration,
    connector: TlsConnector,
    next_id: AtomicU64,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle_timeout", &self.idle_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration, connect_timeout: Duration) -> Self {
        Self::with_connector(idle_timeout, connect_timeout, tls::client_connector())
    }

    pub fn with_connector(idle_timeout: Duration, connect_timeout: Duration, connector: TlsConnector) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            idle_timeout,
            connect_timeout,
            connector,
            next_id: AtomicU64::new(1),
        }
    }

    /// Reuse an idle connection for `key` or dial a new one.
    pub async fn checkout(&self, key: &PoolKey) -> Result<PooledConnection> {
        if let Some(idle) = self.take_idle(key) {
            metrics::record_pool_checkout(true);
            tracing::trace!(upstream = %key, connection = idle.id, "Reusing pooled connection");
            return Ok(PooledConnection {
                id: idle.id,
                key: key.clone(),
                stream: idle.stream,
                reused: true,
                reusable: true,
            });
        }
        metrics::record_pool_checkout(false);
        self.connect(key).await
    }

    /// Always dial a new connection (used for retries).
    pub async fn connect(&self, key: &PoolKey) -> Result<PooledConnection> {
        let tls = key.tls.then(|| (&self.connector, key.host.as_str()));
        let stream = tls::dial(&key.host, key.port, tls, self.connect_timeout).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(upstream = %key, connection = id, "Opened upstream connection");
        Ok(PooledConnection {
            id,
            key: key.clone(),
            stream,
            reused: false,
            reusable: true,
        })
    }

    /// Return a connection. Non-reusable connections are closed instead.
    pub fn release(&self, conn: PooledConnection) {
        if !conn.reusable {
            metrics::record_pool_eviction("not_reusable");
            tracing::trace!(upstream = %conn.key, connection = conn.id, "Closing non-reusable connection");
            return;
        }
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        idle.entry(conn.key).or_default().push(IdleConnection {
            id: conn.id,
            stream: conn.stream,
            last_activity: Instant::now(),
        });
    }

    /// Number of idle connections held for `key`.
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        let idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        idle.get(key).map(Vec::len).unwrap_or(0)
    }

    fn take_idle(&self, key: &PoolKey) -> Option<IdleConnection> {
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let timeout = self.idle_timeout;
        idle.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| now.duration_since(e.last_activity) < timeout);
            for _ in entries.len()..before {
                metrics::record_pool_eviction("idle_timeout");
            }
            !entries.is_empty()
        });

        let entries = idle.get_mut(key)?;
        let conn = entries.pop();
        if entries.is_empty() {
            idle.remove(key);
        }
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn local_key() -> (TcpListener, PoolKey) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (
            listener,
            PoolKey {
                host: "127.0.0.1".into(),
                port,
                tls: false,
            },
        )
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let (listener, key) = local_key().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let pool = ConnectionPool::new(Duration::from_secs(30), Duration::from_secs(1));

        let conn = pool.checkout(&key).await.unwrap();
        let first_id = conn.id();
        assert!(!conn.is_reused());
        pool.release(conn);
        assert_eq!(pool.idle_count(&key), 1);

        let conn = pool.checkout(&key).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(conn.id(), first_id);
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[tokio::test]
    async fn unreusable_connections_are_evicted() {
        let (listener, key) = local_key().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let pool = ConnectionPool::new(Duration::from_secs(30), Duration::from_secs(1));

        let mut conn = pool.checkout(&key).await.unwrap();
        conn.set_reusable(false);
        pool.release(conn);
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[tokio::test]
    async fn idle_timeout_evicts_lazily() {
        let (listener, key) = local_key().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let pool = ConnectionPool::new(Duration::from_millis(20), Duration::from_secs(1));

        let conn = pool.checkout(&key).await.unwrap();
        let first_id = conn.id();
        pool.release(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let conn = pool.checkout(&key).await.unwrap();
        assert!(!conn.is_reused());
        assert_ne!(conn.id(), first_id);
    }
}
