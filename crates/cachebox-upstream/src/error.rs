//! Error types for upstream requests.

use thiserror::Error;

/// Result type alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Errors that can occur talking to an upstream registry.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport-level failure (connect, TLS, read).
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Client construction failure.
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),

    /// Credential exchange failure.
    #[error("authentication error: {0}")]
    Auth(String),
}
