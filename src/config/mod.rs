//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → tunnel keys and domain aliases swapped atomically
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only the reloadable subset is applied after startup

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::HttpConfig;
pub use schema::ListenerConfig;
pub use schema::RouteConfig;
pub use schema::RouteKind;
pub use schema::SatelliteConfig;
pub use schema::ServerConfig;
pub use schema::TunnelConfig;
pub use schema::TunnelKeyConfig;
pub use schema::UpstreamConfig;
