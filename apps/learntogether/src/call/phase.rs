use super::peer::RemoteStream;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Idle,
    AwaitingMedia,
    ConnectingToRelay,
    WaitingForPeer,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

impl CallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::AwaitingMedia => "awaiting-media",
            CallPhase::ConnectingToRelay => "connecting-to-relay",
            CallPhase::WaitingForPeer => "waiting-for-peer",
            CallPhase::Negotiating => "negotiating",
            CallPhase::Connected => "connected",
            CallPhase::Disconnected => "disconnected",
            CallPhase::Failed => "failed",
        }
    }

    /// Status line shown to the user for this phase.
    pub fn status_text(self) -> &'static str {
        match self {
            CallPhase::Idle => "Enter your name to join",
            CallPhase::AwaitingMedia => "Requesting camera and microphone...",
            CallPhase::ConnectingToRelay => "Connecting to server...",
            CallPhase::WaitingForPeer => "Waiting for someone to join...",
            CallPhase::Negotiating => "Connecting to peer...",
            CallPhase::Connected => "Connected",
            CallPhase::Disconnected => "Peer disconnected, finding a new partner...",
            CallPhase::Failed => "Something went wrong",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the offer/answer exchange this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub sender: String,
    pub text: String,
    pub local: bool,
}

/// Requests from the user interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    Join { name: String },
    SendChat { text: String },
    Leave,
    Shutdown,
}

/// Notifications for the user interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PhaseChanged(CallPhase),
    Error(String),
    Chat(TranscriptEntry),
    RemoteStream(Option<RemoteStream>),
}
