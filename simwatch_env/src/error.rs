//! Error types for the SimWatch transport layer.

use thiserror::Error;

/// Errors that can occur while talking to the simulation server.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Request could not be delivered (connection refused, reset, DNS, ...)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Base URL or stream locator could not be turned into a valid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request/response body serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stream connection failed or broke mid-stream
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an invalid-URL error.
    pub fn invalid_url(msg: impl std::fmt::Display) -> Self {
        Self::InvalidUrl(msg.to_string())
    }

    /// Creates a stream error.
    pub fn stream(msg: impl std::fmt::Display) -> Self {
        Self::StreamError(msg.to_string())
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
