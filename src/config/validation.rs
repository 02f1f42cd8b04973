//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (frame sizes, buffer capacity)
//! - Check route targets are usable before the server starts
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use url::Url;

use crate::config::schema::{RouteKind, ServerConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

const MIN_FRAME_SIZE: usize = 1024;

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if config.http.receive_buffer_bytes == 0 {
        errors.push(ValidationError::new("http.receive_buffer_bytes", "must be greater than 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }
    if config.proxy.max_attempts == 0 {
        errors.push(ValidationError::new("proxy.max_attempts", "must be at least 1"));
    }

    for (i, route) in config.routes.iter().enumerate() {
        let field = format!("routes[{}]", i);
        if route.path.is_empty() {
            errors.push(ValidationError::new(&field, "path must not be empty"));
        }
        match &route.kind {
            RouteKind::Proxy { target } => match Url::parse(target) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                    if url.host_str().is_none() {
                        errors.push(ValidationError::new(&field, "proxy target has no host"));
                    }
                }
                Ok(url) => errors.push(ValidationError::new(
                    &field,
                    format!("unsupported proxy scheme '{}'", url.scheme()),
                )),
                Err(e) => errors.push(ValidationError::new(&field, format!("invalid proxy target: {}", e))),
            },
            RouteKind::File { file } if file.is_empty() => {
                errors.push(ValidationError::new(&field, "file route needs a file path"));
            }
            RouteKind::Directory { directory } if directory.is_empty() => {
                errors.push(ValidationError::new(&field, "directory route needs a directory"));
            }
            _ => {}
        }
    }

    if config.tunnel.enabled {
        if config.tunnel.max_frame_size < MIN_FRAME_SIZE {
            errors.push(ValidationError::new(
                "tunnel.max_frame_size",
                format!("must be at least {}", MIN_FRAME_SIZE),
            ));
        }
        if config.http.receive_buffer_bytes < 2 * config.tunnel.max_frame_size {
            errors.push(ValidationError::new(
                "http.receive_buffer_bytes",
                "must be at least twice tunnel.max_frame_size",
            ));
        }
        for (i, key) in config.tunnel.keys.iter().enumerate() {
            if key.secret.is_empty() {
                errors.push(ValidationError::new(format!("tunnel.keys[{}].secret", i), "must not be empty"));
            }
        }
    }

    if config.satellite.enabled {
        if config.satellite.primary_address.is_empty() {
            errors.push(ValidationError::new("satellite.primary_address", "required when satellite is enabled"));
        }
        if config.satellite.secret.is_empty() {
            errors.push(ValidationError::new("satellite.secret", "required when satellite is enabled"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
