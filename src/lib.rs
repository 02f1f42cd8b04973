//! edge-relay: a self-hosted HTTP/1.1 server with a reverse proxy and a
//! multiplexing tunnel between a primary instance and satellites.

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod routing;

// Traffic forwarding
pub mod proxy;
pub mod tunnel;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
