//! Crate-wide error type.
//!
//! Each subsystem keeps its own error enum close to the code that produces it;
//! this type is what crosses subsystem boundaries (handlers, startup, tunnel
//! session loops).

use crate::config::loader::ConfigError;
use crate::http::parser::ParseError;
use crate::net::listener::ListenerError;
use crate::tunnel::frame::FrameError;

/// Errors surfaced by the server and its handlers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("tunnel protocol error: {0}")]
    Tunnel(#[from] FrameError),

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Handler(String),
}

impl Error {
    /// Shorthand for handler-level failures with a plain message.
    pub fn handler(message: impl Into<String>) -> Self {
        Error::Handler(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
