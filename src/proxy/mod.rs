//! Reverse proxy to HTTP/HTTPS upstreams.
//!
//! # Data Flow
//! ```text
//! RouteTable match (proxy route)
//!     → route.rs (rewrite request line, forward headers, retry loop)
//!     → pool.rs (checkout idle or dial; TLS for https targets)
//!     → reader.rs (upstream head + body framing)
//!     → verbatim relay to Downstream, or buffered rewrite via Interceptor
//!     → connection released back to the pool when reusable
//! ```

pub mod pool;
pub mod reader;
pub mod route;

pub use pool::{ConnectionPool, PoolKey, PooledConnection};
pub use reader::{Framing, ResponseHead, UpstreamError, UpstreamReader};
pub use route::{Interceptor, ProxyRoute};
