//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Request (host, decoded path)
//!     → table.rs (alias → canonical domain → default domain fallback)
//!     → exact key `domain/path`
//!     → else closest wildcard `domain/prefix/*`, walking up one segment at a time
//!     → Return: (RouteHandler, short path) or no match (404)
//! ```
//!
//! # Design Decisions
//! - Routes are mutable at runtime: tunnel sessions add and remove them
//! - Handlers are a tagged enum (sync closure or async trait object)
//! - Deterministic: the longest matching prefix always wins

pub mod handler;
pub mod table;

pub use handler::{Handler, RequestContext, RouteHandler};
pub use table::{ResolvedRoute, RouteOwner, RouteTable};
