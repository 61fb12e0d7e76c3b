//! Error types for the group-call mesh

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or running a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Call store / membership backend error
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Call does not exist or has expired
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Call has already ended
    #[error("Call has ended: {0}")]
    CallEnded(String),

    /// Call reached its participant limit
    #[error("Call is full: {0}")]
    CallFull(String),

    /// Participant unknown to the call store
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Signaling relay error (send or acknowledge)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// No peer connection record for this participant
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Description change attempted in a signaling state that does not allow it
    #[error("Invalid signaling state: {0}")]
    InvalidSignalingState(String),

    /// Microphone could not be acquired
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Native peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Operation attempted after the call was torn down
    #[error("Call session closed")]
    SessionClosed,

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl Error {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendError(_) | Error::SignalingError(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::InvalidSignalingState(_)
        )
    }

    /// Check if this error should be shown to the user rather than only logged
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::MediaAcquisition(_)
                | Error::CallNotFound(_)
                | Error::CallEnded(_)
                | Error::CallFull(_)
        )
    }
}
