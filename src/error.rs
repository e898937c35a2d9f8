use crate::state::SessionState;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Signaling service is not connected. Retryable by the caller.
    #[error("signaling channel is unavailable")]
    ChannelUnavailable,
    /// The transport engine rejected an SDP create/set call. The session has been torn down.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    /// Data channel send attempted while the channel is absent or not open.
    #[error("data channel is not open")]
    ChannelNotOpen,
    /// An event or signaling frame could not be decoded.
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    /// Entry point called while the session is in a state that does not allow it.
    #[error("operation not allowed in {0:?} state")]
    InvalidState(SessionState),
    /// The session loop is no longer running.
    #[error("session has been closed")]
    SessionClosed,
    #[error(transparent)]
    Engine(Arc<webrtc::Error>),
}

impl Error {
    /// Converts any engine-level failure into [Error::NegotiationFailed]. Errors which already
    /// belong to the session taxonomy are kept as they are.
    pub fn into_negotiation_failure(self) -> Self {
        match self {
            Error::Engine(e) => Error::NegotiationFailed(e.to_string()),
            Error::MalformedEvent(reason) => Error::NegotiationFailed(reason),
            other => other,
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Engine(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedEvent(value.to_string())
    }
}
