//! Error types for video sessions

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a video session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// User or platform refused camera/microphone access
    #[error("Device access denied: {0}")]
    DeviceDenied(String),

    /// No usable capture device
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Join token invalid or expired, or caller not a room member
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Signaling transport could not be established
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Reconnection attempts exhausted or the media link failed
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Malformed or unexpected offer/answer/candidate
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Room is already ended and immutable
    #[error("Room ended: {0}")]
    RoomEnded(String),

    /// Room does not exist
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current state (caller error)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Session torn down while an operation was suspended
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Room Service error not covered by a more specific variant
    #[error("Room Service error: {0}")]
    RoomService(#[from] teleconsult_core::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Map a Room Service error raised while looking up a room on join
    pub fn from_room_lookup(room_id: &str, err: teleconsult_core::Error) -> Self {
        use teleconsult_core::Error as Rs;

        match err {
            Rs::NotFound(_) => Error::RoomNotFound(room_id.to_string()),
            Rs::InvalidToken(msg) | Rs::Unauthorized(msg) => Error::AuthRejected(msg),
            other if other.is_retryable() => Error::ConnectFailed(other.to_string()),
            other => Error::RoomService(other),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectFailed(_))
    }

    /// Check if this error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DeviceDenied(_)
                | Error::DeviceUnavailable(_)
                | Error::AuthRejected(_)
                | Error::ConnectionLost(_)
                | Error::NegotiationFailed(_)
                | Error::RoomEnded(_)
                | Error::RoomNotFound(_)
        )
    }

    /// Check if this error is a join pre-condition failure (no call attempted)
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::RoomEnded(_) | Error::RoomNotFound(_))
    }
}
