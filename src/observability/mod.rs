//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms via `metrics`)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Request ID (`X-Request-Id`) appears in handler and proxy log events
//! - HTTP request metrics are recorded by a response-pipeline post-processor,
//!   so proxied and tunnelled responses are counted too

pub mod logging;
pub mod metrics;
