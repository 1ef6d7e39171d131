//! Error types for trauth

use std::io;

use thiserror::Error;

/// Result type alias for trauth
pub type Result<T> = std::result::Result<T, Error>;

/// trauth errors
///
/// Only configuration loading and session persistence produce errors.
/// Rule evaluation and credential or certificate checks report plain
/// outcomes instead, so an authentication failure is never an `Error`.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session cookie could not be written
    #[error("Session error: {0}")]
    Session(String),

    /// TLS listener setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error should abort startup
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Tls(_))
    }
}
