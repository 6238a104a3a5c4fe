//! Common error types for the VHC workspace

use thiserror::Error;

/// Common result type for VHC operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the VHC engine and its adapters
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested job or finding absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input (negative labour hours, malformed override, ...)
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Decision transition outside the legal graph
    #[error("Illegal decision transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Network or store failure on a write
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// True for failures that a retry against the store could resolve
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Database(_))
    }
}
