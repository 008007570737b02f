use super::error::CallError;
use super::media::{LocalMedia, TrackKind};
use crate::config::IceServerConfig;
use async_trait::async_trait;
use relay_proto::{IceCandidate, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// The peer's media as seen locally, grown track by track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack {
        stream_id: String,
        track: RemoteTrack,
    },
    ConnectionState(LinkState),
    IceState(IceState),
}

/// A peer event tagged with the generation of the connection that raised it.
#[derive(Debug, Clone)]
pub struct PeerSignal {
    pub generation: u64,
    pub event: PeerEvent,
}

/// Handed to a peer connection so its callbacks can reach the session.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerSignal>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerSignal>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        if self
            .tx
            .send(PeerSignal {
                generation: self.generation,
                event,
            })
            .is_err()
        {
            tracing::trace!(
                target = "call",
                generation = self.generation,
                "peer event dropped; session gone"
            );
        }
    }
}

/// One peer-to-peer connection, as driven by the signaling state machine.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    fn signaling_state(&self) -> SignalingState;
    async fn close(&self) -> Result<(), CallError>;
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Opens a connection with every live local track attached.
    async fn open(
        &self,
        ice_servers: &[IceServerConfig],
        media: &LocalMedia,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, CallError>;
}
