//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake)
//!     → stream.rs (plain and TLS unified)
//!     → connection.rs (id, active tracking)
//!     → Hand off to HTTP layer
//!
//! Outgoing (upstream pool, satellite):
//!     tls.rs dial → stream.rs
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod stream;
pub mod tls;

pub use stream::MaybeTlsStream;
