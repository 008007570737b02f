use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("no media device available: {0}")]
    NoDevice(String),
    #[error("media capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media unavailable: {0}")]
    Media(#[from] MediaError),
    #[error("relay error: {0}")]
    Relay(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("display name must not be empty")]
    EmptyName,
    #[error("operation not allowed while {0}")]
    InvalidPhase(&'static str),
    #[error("channel closed")]
    ChannelClosed,
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        CallError::Negotiation(err.to_string())
    }
}
