//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (or tunnel shim)
//!     → server.rs (read loop, one task per connection)
//!     → parser.rs (fixed receive buffer, head parse, body sink)
//!         → body.rs (memory or spooled temp file)
//!         → form.rs (query, urlencoded, multipart, JSON binding)
//!     → routing::RouteTable (domain + path → handler)
//!     → handler (handlers.rs, proxy, tunnel forwarding, websocket.rs)
//!     → pipeline.rs (range, gzip, framing)
//!         → chunked.rs (chunked transfer, optional gzip)
//!     → Send to client
//! ```

pub mod body;
pub mod chunked;
pub mod form;
pub mod handlers;
pub mod headers;
pub mod parser;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use headers::Headers;
pub use pipeline::{Downstream, ResponsePipeline};
pub use request::{ConnectionInfo, Request, X_REQUEST_ID};
pub use response::{Response, ResponseBody};
pub use server::{ClientEof, HttpServer};
