//! In-memory media, peer and relay implementations for driving a
//! `CallSession` without devices or network.

use super::error::{CallError, MediaError};
use super::media::{LocalMedia, MediaConstraints, MediaDevices, MediaTrack, TrackKind};
use super::peer::{PeerEvent, PeerEventSink, PeerLink, PeerLinkFactory, SignalingState};
use super::relay::{RelayConnector, RelayEvents, RelayLink};
use crate::config::IceServerConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use relay_proto::{ClientEvent, IceCandidate, RelayEvent, SdpKind, SessionDescription};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub struct MockTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
    stop_calls: AtomicUsize,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            live: AtomicBool::new(true),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

pub struct MockMedia {
    failure: Option<MediaError>,
    acquired: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockMedia {
    pub fn granting() -> Self {
        Self {
            failure: None,
            acquired: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: MediaError) -> Self {
        Self {
            failure: Some(err),
            acquired: Mutex::new(Vec::new()),
        }
    }

    /// Every track handed out so far.
    pub fn tracks(&self) -> Vec<Arc<MockTrack>> {
        self.acquired.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for MockMedia {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let mut acquired = self.acquired.lock();
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        for (wanted, kind) in [
            (constraints.audio, TrackKind::Audio),
            (constraints.video, TrackKind::Video),
        ] {
            if wanted {
                let track = Arc::new(MockTrack::new(format!("{kind}-{}", acquired.len()), kind));
                acquired.push(Arc::clone(&track));
                tracks.push(track);
            }
        }
        Ok(LocalMedia::new("mock-stream", tracks))
    }
}

/// Calls made on a `MockPeerLink`, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

struct LinkInner {
    signaling: SignalingState,
    has_remote: bool,
    offers: usize,
    calls: Vec<LinkCall>,
}

/// Peer connection that follows the browser's signaling-state rules and
/// rejects candidates added before a remote description.
pub struct MockPeerLink {
    label: String,
    sink: PeerEventSink,
    inner: Mutex<LinkInner>,
}

impl MockPeerLink {
    fn new(label: String, sink: PeerEventSink) -> Self {
        Self {
            label,
            sink,
            inner: Mutex::new(LinkInner {
                signaling: SignalingState::Stable,
                has_remote: false,
                offers: 0,
                calls: Vec::new(),
            }),
        }
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, call: &LinkCall) -> usize {
        self.inner.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn close_count(&self) -> usize {
        self.count(&LinkCall::Close)
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// Raises an event as if the underlying connection produced it.
    pub fn emit(&self, event: PeerEvent) {
        self.sink.emit(event);
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::CreateOffer { ice_restart });
        inner.offers += 1;
        Ok(SessionDescription::offer(format!(
            "{}-offer-{}",
            self.label, inner.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::CreateAnswer);
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(CallError::Negotiation("no remote offer to answer".into()));
        }
        Ok(SessionDescription::answer(format!("{}-answer", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::SetLocal(desc.kind));
        inner.signaling = match (inner.signaling, desc.kind) {
            (SignalingState::Stable, SdpKind::Offer) => SignalingState::HaveLocalOffer,
            (SignalingState::HaveRemoteOffer, SdpKind::Answer) => SignalingState::Stable,
            (state, kind) => {
                return Err(CallError::Negotiation(format!(
                    "cannot set local {kind:?} in {state:?}"
                )));
            }
        };
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::SetRemote(desc.kind));
        inner.signaling = match (inner.signaling, desc.kind) {
            (SignalingState::Stable, SdpKind::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, SdpKind::Answer) => SignalingState::Stable,
            (state, kind) => {
                return Err(CallError::Negotiation(format!(
                    "cannot set remote {kind:?} in {state:?}"
                )));
            }
        };
        inner.has_remote = true;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::AddCandidate(candidate.candidate));
        if !inner.has_remote {
            return Err(CallError::Negotiation(
                "remote description not set".into(),
            ));
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling
    }

    async fn close(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        inner.calls.push(LinkCall::Close);
        inner.signaling = SignalingState::Closed;
        Ok(())
    }
}

pub struct MockPeerFactory {
    label: String,
    links: Mutex<Vec<Arc<MockPeerLink>>>,
}

impl MockPeerFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn links(&self) -> Vec<Arc<MockPeerLink>> {
        self.links.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockPeerLink>> {
        self.links.lock().last().cloned()
    }
}

#[async_trait]
impl PeerLinkFactory for MockPeerFactory {
    async fn open(
        &self,
        _ice_servers: &[IceServerConfig],
        _media: &LocalMedia,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let link = Arc::new(MockPeerLink::new(self.label.clone(), events));
        self.links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

pub struct MockRelayLink {
    sent: Arc<Mutex<Vec<ClientEvent>>>,
    closed: AtomicUsize,
}

impl MockRelayLink {
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayLink for MockRelayLink {
    fn send(&self, event: ClientEvent) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) > 0 {
            return Err(CallError::ChannelClosed);
        }
        self.sent.lock().push(event);
        Ok(())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Relay that records outbound frames and lets tests inject inbound ones.
pub struct MockRelayConnector {
    refuse: AtomicBool,
    connects: AtomicUsize,
    sent: Arc<Mutex<Vec<ClientEvent>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<RelayEvent>>>,
    links: Mutex<Vec<Arc<MockRelayLink>>>,
}

impl MockRelayConnector {
    pub fn new() -> Self {
        Self {
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: Mutex::new(None),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing() -> Self {
        let connector = Self::new();
        connector.set_refusing(true);
        connector
    }

    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Queues `event` on the most recent connection.
    pub fn inject(&self, event: RelayEvent) -> bool {
        match self.inbound.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Ends the most recent connection's event stream.
    pub fn drop_connection(&self) {
        self.inbound.lock().take();
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn links(&self) -> Vec<Arc<MockRelayLink>> {
        self.links.lock().clone()
    }
}

impl Default for MockRelayConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayConnector for MockRelayConnector {
    async fn connect(&self, _url: &str) -> Result<(Arc<dyn RelayLink>, RelayEvents), CallError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CallError::Relay("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        let link = Arc::new(MockRelayLink {
            sent: Arc::clone(&self.sent),
            closed: AtomicUsize::new(0),
        });
        self.links.lock().push(Arc::clone(&link));
        Ok((link, rx))
    }
}

/// What a relay delivers to the addressee when `from` sends `event`.
/// Pairing and room events are not peer-addressed and yield `None`.
pub fn relay_forward(event: ClientEvent, from: &str) -> Option<RelayEvent> {
    match event {
        ClientEvent::Offer { offer, .. } => Some(RelayEvent::OfferReceived {
            offer,
            from: from.to_string(),
        }),
        ClientEvent::Answer { answer, .. } => Some(RelayEvent::AnswerReceived { answer }),
        ClientEvent::IceCandidate { candidate, .. } => {
            Some(RelayEvent::IceCandidateReceived { candidate })
        }
        ClientEvent::ChatMessage { sender, text } => Some(RelayEvent::ChatMessage { sender, text }),
        ClientEvent::Register { .. }
        | ClientEvent::FindPeer
        | ClientEvent::ChatJoin { .. }
        | ClientEvent::ChatBroadcast(_) => None,
    }
}
