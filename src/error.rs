//! Error types for the Altaro exporter.
//!
//! This module defines custom error types using `thiserror` for structured
//! error handling throughout the application.

use thiserror::Error;

/// Main error type for Altaro exporter operations.
#[derive(Debug, Error)]
pub enum AltaroError {
    /// No usable response from the Altaro REST API (connection, timeout, HTTP status)
    #[error("Altaro API transport error: {0}")]
    Transport(reqwest::Error),

    /// The API answered but reported `Success: false`
    #[error("Altaro API error: {0}")]
    Api(String),

    /// The API rejected the session token
    #[error("Altaro API rejected session token: {0}")]
    InvalidToken(String),

    /// Error parsing Altaro API response
    #[error("Failed to parse Altaro API response: {0}")]
    ParseError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Login rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Login rejected because the server still holds a session for us
    #[error("Altaro session already open: {0}")]
    SessionBusy(String),

    /// A single VM field could not be mapped to a metric value
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Metrics error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// HTTP server error
    #[error("HTTP server error: {0}")]
    Server(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AltaroError {
    /// Whether a logout/login cycle followed by one more attempt may fix this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AltaroError::Transport(_) | AltaroError::InvalidToken(_))
    }
}

// Request URLs carry the session token, keep them out of error text.
impl From<reqwest::Error> for AltaroError {
    fn from(e: reqwest::Error) -> Self {
        AltaroError::Transport(e.without_url())
    }
}

/// Result type alias for Altaro exporter operations.
pub type Result<T> = std::result::Result<T, AltaroError>;
