//! Error types for the mirror surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for request handling.
pub type Result<T> = std::result::Result<T, ServeError>;

/// Errors surfaced to the client.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Malformed request (missing `ns`, unsupported method). The message
    /// is sent as the response body.
    #[error("{0}")]
    BadRequest(String),

    /// No route matched.
    #[error("not found")]
    NotFound,

    /// Cache lookup or read failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Upstream transport failure.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ServeError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Cache(_) | Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            other => other.status_code().into_response(),
        }
    }
}
