//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the route table from configured routes
//! - Bind the HTTP listener (TLS when configured) and start accepting
//! - Start the tunnel listener (primary) and/or the satellite loop
//! - Apply the reloadable config subset on change
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last, once every route is registered

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{RouteKind, ServerConfig};
use crate::error::{Error, Result};
use crate::http::handlers::{self, DirectoryHandler};
use crate::http::server::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::listener::Listener;
use crate::net::tls;
use crate::proxy::pool::ConnectionPool;
use crate::proxy::route::ProxyRoute;
use crate::resilience::retries::RetryPolicy;
use crate::routing::handler::RouteHandler;
use crate::routing::table::RouteTable;
use crate::tunnel::auth::KeyRegistry;
use crate::tunnel::primary::TunnelServer;
use crate::tunnel::satellite::Satellite;

/// Handles to everything `start` launched.
pub struct RunningServer {
    pub http_addr: SocketAddr,
    pub tunnel_addr: Option<SocketAddr>,
    pub http: Arc<HttpServer>,
    pub routes: Arc<RouteTable>,
    pub pool: Arc<ConnectionPool>,
    pub tunnel_keys: Option<Arc<KeyRegistry>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Apply the reloadable subset of a new configuration.
    pub fn apply_reload(&self, config: &ServerConfig) {
        self.routes.set_aliases(config.http.aliases.clone());
        if let Some(keys) = &self.tunnel_keys {
            keys.replace(&config.tunnel.keys);
        }
        tracing::info!(aliases = config.http.aliases.len(), "Configuration reloaded");
    }

    /// Wait for every background task to exit.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Register every configured route in a new table.
pub fn build_routes(config: &ServerConfig, pool: &Arc<ConnectionPool>) -> Result<RouteTable> {
    let routes = RouteTable::new(config.http.default_domain.clone());
    routes.set_aliases(config.http.aliases.clone());
    let retry = RetryPolicy::from_config(&config.proxy);

    for route in &config.routes {
        let handler = match &route.kind {
            RouteKind::Static { body, content_type } => {
                handlers::static_bytes(Bytes::from(body.clone()), content_type.clone())
            }
            RouteKind::File { file } => handlers::single_file(PathBuf::from(file)),
            RouteKind::Directory { directory } => RouteHandler::from_handler(DirectoryHandler::new(directory)),
            RouteKind::Proxy { target } => {
                let target = Url::parse(target)
                    .map_err(|e| Error::Proxy(format!("invalid proxy target '{}': {}", target, e)))?;
                let proxy = ProxyRoute::new(
                    target,
                    Arc::clone(pool),
                    retry,
                    config.proxy.forwarded_headers,
                )?;
                RouteHandler::from_handler(proxy)
            }
        };
        routes.add(route.domain.as_deref(), &route.path, handler);
    }

    tracing::info!(routes = routes.len(), default_domain = %routes.default_domain(), "Route table built");
    Ok(routes)
}

/// Start every configured subsystem. Accept loops stop on `shutdown`.
pub async fn start(config: &ServerConfig, shutdown: &Shutdown) -> Result<RunningServer> {
    tls::install_crypto_provider();
    let pool = Arc::new(ConnectionPool::new(
        Duration::from_secs(config.proxy.idle_timeout_secs),
        Duration::from_secs(config.timeouts.connect_secs),
    ));
    let routes = Arc::new(build_routes(config, &pool)?);

    let acceptor = match &config.listener.tls {
        Some(tls_config) => Some(tls::load_acceptor(
            Path::new(&tls_config.cert_path),
            Path::new(&tls_config.key_path),
        )?),
        None => None,
    };

    let http = Arc::new(HttpServer::new(config, Arc::clone(&routes), acceptor));
    let listener = Listener::bind(&config.listener).await?;
    let http_addr = listener.local_addr()?;
    let mut tasks = Vec::new();

    let server = Arc::clone(&http);
    let http_shutdown = shutdown.subscribe();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server.run(listener, http_shutdown).await {
            tracing::error!(error = %e, "HTTP server exited with error");
        }
    }));

    let mut tunnel_addr = None;
    let mut tunnel_keys = None;
    if config.tunnel.enabled {
        let keys = Arc::new(KeyRegistry::new(&config.tunnel.keys));
        let tunnel = Arc::new(TunnelServer::new(
            Arc::clone(&routes),
            Arc::clone(&keys),
            config.tunnel.max_frame_size,
        ));
        let listener = TcpListener::bind(config.tunnel.bind_address.as_str()).await?;
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, keys = config.tunnel.keys.len(), "Tunnel listener bound");

        let tunnel_shutdown = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = tunnel.run(listener, tunnel_shutdown).await {
                tracing::error!(error = %e, "Tunnel server exited with error");
            }
        }));
        tunnel_addr = Some(addr);
        tunnel_keys = Some(keys);
    }

    if config.satellite.enabled {
        let satellite = Arc::new(Satellite::new(
            config.satellite.clone(),
            Arc::clone(&http),
            config.tunnel.max_frame_size,
            Duration::from_secs(config.timeouts.connect_secs),
        ));
        tracing::info!(primary = %config.satellite.primary_address, "Satellite enabled");
        let satellite_shutdown = shutdown.subscribe();
        tasks.push(tokio::spawn(satellite.run(satellite_shutdown)));
    }

    Ok(RunningServer {
        http_addr,
        tunnel_addr,
        http,
        routes,
        pool,
        tunnel_keys,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    fn route(domain: Option<&str>, path: &str, kind: RouteKind) -> RouteConfig {
        RouteConfig {
            domain: domain.map(str::to_string),
            path: path.to_string(),
            kind,
        }
    }

    #[test]
    fn configured_routes_are_registered() {
        let mut config = ServerConfig::default();
        config.routes = vec![
            route(
                None,
                "/hello",
                RouteKind::Static {
                    body: "hi".into(),
                    content_type: "text/plain".into(),
                },
            ),
            route(
                Some("api.example"),
                "/v1/*",
                RouteKind::Proxy {
                    target: "http://127.0.0.1:9/".into(),
                },
            ),
        ];
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1), Duration::from_secs(1)));
        let routes = build_routes(&config, &pool).unwrap();

        assert_eq!(routes.len(), 2);
        assert!(routes.resolve("localhost", "/hello").is_some());
        let resolved = routes.resolve("api.example", "/v1/users/7").unwrap();
        assert_eq!(resolved.short_path, "users/7");
    }

    #[test]
    fn bad_proxy_target_fails_startup() {
        let mut config = ServerConfig::default();
        config.routes = vec![route(
            None,
            "/x/*",
            RouteKind::Proxy {
                target: "not a url".into(),
            },
        )];
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1), Duration::from_secs(1)));
        assert!(build_routes(&config, &pool).is_err());
    }

    #[tokio::test]
    async fn start_binds_listener_with_builtin_tls_stack() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        let shutdown = Shutdown::new();

        let running = start(&config, &shutdown).await.unwrap();
        assert_ne!(running.http_addr.port(), 0);
        assert!(running.tunnel_addr.is_none());
    }
}
