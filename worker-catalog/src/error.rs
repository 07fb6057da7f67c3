use crate::session::SessionId;
use std::path::PathBuf;

/// Errors surfaced to callers of the worker catalog.
///
/// Start failures, missing workers on stop and stop failures are recovered
/// inside the catalog and only show up in logs and `StopOutcome`.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("A worker already exists for session: {session_id}")]
    DuplicateSession { session_id: SessionId },
}

/// Errors from the concurrency limiter
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("Invalid {field}: timeout must be at least 1 second")]
    InvalidTimeout { field: String },

    #[error("Invalid limiter capacity: {capacity} must be at least 1")]
    InvalidCapacity { capacity: usize },

    #[error("Limiter has been closed")]
    Closed,
}

/// Errors from the bounded retry combinator
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: std::fmt::Display + std::fmt::Debug,
{
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: E,
    },
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid {field}: max_attempts must be at least 1")]
    InvalidAttempts { field: String },

    #[error("Invalid {field}: timeout must be at least 1 second")]
    InvalidTimeout { field: String },

    #[error("Invalid limiter capacity: {capacity} must be at least 1")]
    InvalidCapacity { capacity: usize },

    #[error("Missing required configuration: {field}")]
    MissingRequiredField { field: String },
}
