//! Tunnel between a primary instance and satellites.
//!
//! # Data Flow
//! ```text
//! Satellite                                   Primary
//!   satellite.rs ── Authenticate, RegisterRoute ──▶ primary.rs (auth.rs scope check)
//!                                                    → RouteTable (ForwardingHandler)
//!   client hits route on primary:
//!   shim.rs ◀── Connect(id), Data(id, request), Data(id, "") ── ForwardingHandler
//!     → local HttpServer
//!   shim.rs ── Data(id, response), Data(id, "") ──▶ mailbox.rs → downstream client
//! ```
//!
//! All frames go through `frame.rs`; each side has a single writer task per
//! connection.

pub mod auth;
pub mod frame;
pub mod mailbox;
pub mod primary;
pub mod satellite;
pub mod shim;

pub use auth::{KeyRegistry, Scope};
pub use frame::{Command, Frame, FrameCodec, FrameError, HandlerKind, Side};
pub use primary::{ForwardingHandler, TunnelServer};
pub use satellite::{Satellite, SessionEnd};
