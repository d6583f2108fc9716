//! Error types for the Room Service contract

use crate::room::RoomStatus;

/// Result type alias using the Room Service error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by Room Service implementations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Join token is invalid, expired, or the caller is not a room member
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Room does not exist
    #[error("Room not found: {0}")]
    NotFound(String),

    /// Caller may not perform this operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No on-call doctor could be assigned to an emergency room
    #[error("No emergency doctor available")]
    NoDoctorAvailable,

    /// Requested status change would move a room backwards
    #[error("Invalid room status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: RoomStatus,
        /// Rejected target status
        to: RoomStatus,
    },

    /// Malformed request (bad base URL, empty ids, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Server answered with an unexpected status code
    #[error("Server error: HTTP {status}: {body}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Response body (truncated by the server, not by us)
        body: String,
    },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Check if this error means the caller lacks access to the room
    pub fn is_access_error(&self) -> bool {
        matches!(self, Error::InvalidToken(_) | Error::Unauthorized(_))
    }
}
