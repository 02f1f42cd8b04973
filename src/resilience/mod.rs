//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to upstream:
//!     → timeouts.rs (connect deadline, per-request deadline)
//!     → On transport failure: retries.rs (retry if nothing sent downstream)
//!     → backoff.rs (jittered delay between attempts)
//!
//! Satellite tunnel:
//!     → backoff.rs (reconnect delay, reset once a session ends cleanly)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Retries never duplicate bytes the client already received
//! - Backoff delays are jittered

pub mod backoff;
pub mod retries;
pub mod timeouts;
