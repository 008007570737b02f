//! Two-party video call signaling.
//!
//! A `CallSession` acquires local media, registers a display name with the
//! relay, and negotiates one peer connection at a time with whichever peer
//! the relay pairs it with. When the peer goes away the session asks the
//! relay for a new one without re-acquiring media.

pub mod error;
pub mod media;
pub mod mock;
pub mod peer;
pub mod phase;
pub mod relay;
pub mod retry;
pub mod rtc;

use crate::config::CallConfig;
use error::CallError;
use media::{LocalMedia, MediaDevices};
use peer::{
    IceState, LinkState, PeerEvent, PeerEventSink, PeerLink, PeerLinkFactory, PeerSignal,
    RemoteStream, SignalingState,
};
use phase::{CallCommand, CallPhase, NegotiationRole, SessionEvent, TranscriptEntry};
use relay::{RelayConnector, RelayEvents, RelayLink, connect_with_retry};
use relay_proto::{ClientEvent, IceCandidate, RelayEvent, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IceRestart {
    NotAttempted,
    InFlight,
    Spent,
}

struct ActivePeer {
    link: Arc<dyn PeerLink>,
    generation: u64,
    remote_name: String,
    role: NegotiationRole,
    remote_description_set: bool,
    ice_restart: IceRestart,
    remote_stream: Option<RemoteStream>,
    link_connected: bool,
}

pub struct CallSession {
    config: CallConfig,
    media_devices: Arc<dyn MediaDevices>,
    peer_factory: Arc<dyn PeerLinkFactory>,
    relay_connector: Arc<dyn RelayConnector>,
    phase: CallPhase,
    display_name: Option<String>,
    local_media: Option<LocalMedia>,
    relay: Option<Arc<dyn RelayLink>>,
    relay_events: Option<RelayEvents>,
    peer: Option<ActivePeer>,
    peer_generation: u64,
    peer_tx: mpsc::UnboundedSender<PeerSignal>,
    peer_rx: mpsc::UnboundedReceiver<PeerSignal>,
    // Remote candidates that arrived before a remote description was applied.
    pending_candidates: Vec<IceCandidate>,
    transcript: Vec<TranscriptEntry>,
    last_error: Option<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        media_devices: Arc<dyn MediaDevices>,
        peer_factory: Arc<dyn PeerLinkFactory>,
        relay_connector: Arc<dyn RelayConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            media_devices,
            peer_factory,
            relay_connector,
            phase: CallPhase::Idle,
            display_name: None,
            local_media: None,
            relay: None,
            relay_events: None,
            peer: None,
            peer_generation: 0,
            peer_tx,
            peer_rx,
            pending_candidates: Vec::new(),
            transcript: Vec::new(),
            last_error: None,
            events,
        };
        (session, events_rx)
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.peer.as_ref().map(|peer| peer.remote_name.as_str())
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.peer.as_ref().map(|peer| peer.role)
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.peer.as_ref().and_then(|peer| peer.remote_stream.as_ref())
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Acquires media, connects to the relay and registers `name`.
    pub async fn join(&mut self, name: &str) -> Result<(), CallError> {
        if !matches!(self.phase, CallPhase::Idle | CallPhase::Failed) {
            return Err(CallError::InvalidPhase(self.phase.as_str()));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(CallError::EmptyName);
        }
        self.display_name = Some(name.to_string());
        self.last_error = None;

        self.set_phase(CallPhase::AwaitingMedia);
        let media = match self.media_devices.acquire(self.config.media).await {
            Ok(media) => media,
            Err(err) => {
                let err = CallError::from(err);
                self.fail(&err);
                return Err(err);
            }
        };
        tracing::debug!(target = "call", media = ?media, "local media acquired");
        self.local_media = Some(media);

        self.set_phase(CallPhase::ConnectingToRelay);
        if let Err(err) = self.connect_relay().await {
            if let Some(media) = self.local_media.take() {
                media.stop_all();
            }
            self.fail(&err);
            return Err(err);
        }
        self.set_phase(CallPhase::WaitingForPeer);
        Ok(())
    }

    /// Tears everything down and returns to `Idle`.
    pub async fn leave(&mut self) {
        self.discard_peer().await;
        self.pending_candidates.clear();
        self.relay_events = None;
        if let Some(relay) = self.relay.take() {
            relay.close().await;
        }
        if let Some(media) = self.local_media.take() {
            media.stop_all();
        }
        self.transcript.clear();
        self.display_name = None;
        self.last_error = None;
        self.set_phase(CallPhase::Idle);
    }

    /// Sends a text line to the paired peer and appends it locally.
    pub fn send_chat(&mut self, text: &str) -> Result<(), CallError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let sender = self
            .display_name
            .clone()
            .ok_or(CallError::InvalidPhase(self.phase.as_str()))?;
        self.relay_send(ClientEvent::ChatMessage {
            sender: sender.clone(),
            text: text.to_string(),
        })?;
        self.append_chat(TranscriptEntry {
            sender,
            text: text.to_string(),
            local: true,
        });
        Ok(())
    }

    pub async fn handle_command(&mut self, command: CallCommand) {
        let result = match command {
            CallCommand::Join { name } => self.join(&name).await,
            CallCommand::SendChat { text } => self.send_chat(&text),
            CallCommand::Leave | CallCommand::Shutdown => {
                self.leave().await;
                Ok(())
            }
        };
        if let Err(err) = result {
            // join() has already reported its own failures.
            if self.phase != CallPhase::Failed {
                self.surface(&err);
            }
        }
    }

    pub async fn handle_relay_event(&mut self, event: RelayEvent) -> Result<(), CallError> {
        if self.local_media.is_none() {
            tracing::debug!(target = "call", event = event.name(), "ignoring relay event while idle");
            return Ok(());
        }
        tracing::debug!(target = "call", event = event.name(), phase = %self.phase, "relay event");
        match event {
            RelayEvent::Waiting => {
                if self.phase == CallPhase::ConnectingToRelay {
                    self.set_phase(CallPhase::WaitingForPeer);
                }
                Ok(())
            }
            RelayEvent::PeerJoined { peer_id, peer_name } => {
                tracing::info!(target = "call", peer_id = %peer_id, peer = %peer_name, "peer joined; sending offer");
                // Nothing buffered before our offer can belong to this peer.
                self.pending_candidates.clear();
                self.open_peer(NegotiationRole::Initiator, peer_name).await?;
                self.send_offer(false).await
            }
            RelayEvent::PeerReady { peer_id, peer_name } => {
                tracing::info!(target = "call", peer_id = %peer_id, peer = %peer_name, "paired; waiting for offer");
                self.open_peer(NegotiationRole::Responder, peer_name).await
            }
            RelayEvent::OfferReceived { offer, from } => self.accept_offer(offer, from).await,
            RelayEvent::AnswerReceived { answer } => self.accept_answer(answer).await,
            RelayEvent::IceCandidateReceived { candidate } => {
                self.accept_remote_candidate(candidate).await;
                Ok(())
            }
            RelayEvent::PeerDisconnected => {
                if self.peer.is_some() {
                    self.restart_pairing("peer left").await;
                } else {
                    self.pending_candidates.clear();
                }
                Ok(())
            }
            RelayEvent::ChatMessage { sender, text } => {
                self.append_chat(TranscriptEntry {
                    sender,
                    text,
                    local: false,
                });
                Ok(())
            }
            RelayEvent::ChatBroadcast(_) => Ok(()),
            RelayEvent::Error { message } => Err(CallError::Relay(message)),
        }
    }

    pub async fn handle_peer_signal(&mut self, signal: PeerSignal) -> Result<(), CallError> {
        let Some(peer) = self.peer.as_mut() else {
            return Ok(());
        };
        if peer.generation != signal.generation {
            tracing::trace!(
                target = "call",
                generation = signal.generation,
                current = peer.generation,
                "dropping event from discarded peer connection"
            );
            return Ok(());
        }

        match signal.event {
            PeerEvent::LocalCandidate(candidate) => {
                let to = peer.remote_name.clone();
                self.relay_send(ClientEvent::IceCandidate { candidate, to })
            }
            PeerEvent::RemoteTrack { stream_id, track } => {
                let stream = peer.remote_stream.get_or_insert_with(|| RemoteStream {
                    stream_id: stream_id.clone(),
                    tracks: Vec::new(),
                });
                if stream.stream_id != stream_id {
                    stream.stream_id = stream_id;
                    stream.tracks.clear();
                }
                if !stream.tracks.iter().any(|t| t.id == track.id) {
                    stream.tracks.push(track);
                }
                let snapshot = stream.clone();
                let _ = self.events.send(SessionEvent::RemoteStream(Some(snapshot)));
                self.set_phase(CallPhase::Connected);
                Ok(())
            }
            PeerEvent::ConnectionState(LinkState::Connected) => {
                peer.link_connected = true;
                if peer.ice_restart == IceRestart::InFlight {
                    peer.ice_restart = IceRestart::Spent;
                }
                if peer.remote_stream.is_some() {
                    self.set_phase(CallPhase::Connected);
                } else {
                    tracing::debug!(target = "call", "peer connection up; waiting for remote media");
                }
                Ok(())
            }
            PeerEvent::ConnectionState(LinkState::Disconnected) => {
                if peer.ice_restart == IceRestart::InFlight {
                    tracing::debug!(target = "call", "disconnected during ice restart");
                    return Ok(());
                }
                self.restart_pairing("peer connection lost").await;
                Ok(())
            }
            PeerEvent::ConnectionState(LinkState::Failed) => {
                let restart = peer.ice_restart;
                match restart {
                    IceRestart::NotAttempted => self.restart_ice().await,
                    IceRestart::InFlight => {}
                    IceRestart::Spent => self.restart_pairing("peer connection failed").await,
                }
                Ok(())
            }
            PeerEvent::IceState(IceState::Failed) => {
                let restart = peer.ice_restart;
                match restart {
                    IceRestart::NotAttempted => self.restart_ice().await,
                    IceRestart::InFlight | IceRestart::Spent => {
                        self.restart_pairing("ice failed after restart").await
                    }
                }
                Ok(())
            }
            PeerEvent::IceState(IceState::Connected | IceState::Completed) => {
                if peer.ice_restart == IceRestart::InFlight {
                    tracing::info!(target = "call", "ice restart recovered the connection");
                    peer.ice_restart = IceRestart::Spent;
                }
                Ok(())
            }
            PeerEvent::ConnectionState(state) => {
                tracing::trace!(target = "call", ?state, "peer connection state");
                Ok(())
            }
            PeerEvent::IceState(state) => {
                tracing::trace!(target = "call", ?state, "ice connection state");
                Ok(())
            }
        }
    }

    /// Processes every queued relay and peer event without waiting for more.
    /// Returns the number of events handled.
    pub async fn drain_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;

            let relay_event = match self.relay_events.as_mut().map(|rx| rx.try_recv()) {
                Some(Ok(event)) => Some(event),
                Some(Err(TryRecvError::Disconnected)) => {
                    self.handle_relay_closed().await;
                    progressed = true;
                    None
                }
                Some(Err(TryRecvError::Empty)) | None => None,
            };
            if let Some(event) = relay_event {
                if let Err(err) = self.handle_relay_event(event).await {
                    self.surface(&err);
                }
                handled += 1;
                progressed = true;
            }

            if let Ok(signal) = self.peer_rx.try_recv() {
                if let Err(err) = self.handle_peer_signal(signal).await {
                    self.surface(&err);
                }
                handled += 1;
                progressed = true;
            }

            if !progressed {
                return handled;
            }
        }
    }

    /// Drives the session until `Shutdown` arrives or the command channel
    /// closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CallCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CallCommand::Shutdown) | None => {
                        self.leave().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                event = next_relay_event(&mut self.relay_events) => match event {
                    Some(event) => {
                        if let Err(err) = self.handle_relay_event(event).await {
                            self.surface(&err);
                        }
                    }
                    None => self.handle_relay_closed().await,
                },
                Some(signal) = self.peer_rx.recv() => {
                    if let Err(err) = self.handle_peer_signal(signal).await {
                        self.surface(&err);
                    }
                }
            }
        }
        tracing::debug!(target = "call", "call session stopped");
    }

    async fn connect_relay(&mut self) -> Result<(), CallError> {
        let name = self
            .display_name
            .clone()
            .ok_or(CallError::InvalidPhase(self.phase.as_str()))?;
        let (link, events) = connect_with_retry(
            self.relay_connector.as_ref(),
            &self.config.relay_url,
            &self.config.relay_retry,
        )
        .await?;
        link.send(ClientEvent::Register { name })?;
        self.relay = Some(link);
        self.relay_events = Some(events);
        Ok(())
    }

    async fn handle_relay_closed(&mut self) {
        self.relay_events = None;
        self.relay = None;
        if self.local_media.is_none() {
            return;
        }
        tracing::warn!(target = "call", phase = %self.phase, "relay connection lost; reconnecting");
        self.discard_peer().await;
        self.pending_candidates.clear();
        self.set_phase(CallPhase::ConnectingToRelay);
        match self.connect_relay().await {
            Ok(()) => self.set_phase(CallPhase::WaitingForPeer),
            Err(err) => {
                if let Some(media) = self.local_media.take() {
                    media.stop_all();
                }
                self.fail(&err);
            }
        }
    }

    async fn open_peer(
        &mut self,
        role: NegotiationRole,
        remote_name: String,
    ) -> Result<(), CallError> {
        self.discard_peer().await;
        let media = self
            .local_media
            .as_ref()
            .ok_or(CallError::InvalidPhase(self.phase.as_str()))?;
        self.peer_generation += 1;
        let sink = PeerEventSink::new(self.peer_generation, self.peer_tx.clone());
        let link = self
            .peer_factory
            .open(&self.config.ice_servers, media, sink)
            .await?;
        self.peer = Some(ActivePeer {
            link,
            generation: self.peer_generation,
            remote_name,
            role,
            remote_description_set: false,
            ice_restart: IceRestart::NotAttempted,
            remote_stream: None,
            link_connected: false,
        });
        self.set_phase(CallPhase::Negotiating);
        Ok(())
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), CallError> {
        let (link, to) = self.active_link()?;
        let offer = link.create_offer(ice_restart).await?;
        link.set_local_description(offer.clone()).await?;
        tracing::debug!(target = "call", to = %to, ice_restart, "sending offer");
        self.relay_send(ClientEvent::Offer { offer, to })
    }

    async fn accept_offer(&mut self, offer: SessionDescription, from: String) -> Result<(), CallError> {
        let reuse = self
            .peer
            .as_ref()
            .is_some_and(|peer| peer.remote_name == from);
        if !reuse {
            self.open_peer(NegotiationRole::Responder, from.clone()).await?;
        }
        let (link, _) = self.active_link()?;
        link.set_remote_description(offer).await?;
        self.mark_remote_description_set();
        self.flush_pending_candidates().await;

        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        tracing::debug!(target = "call", to = %from, "sending answer");
        self.relay_send(ClientEvent::Answer { answer, to: from })
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        let Ok((link, _)) = self.active_link() else {
            tracing::warn!(target = "call", "answer received with no peer connection");
            return Ok(());
        };
        let state = link.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::warn!(target = "call", ?state, "ignoring answer; no local offer outstanding");
            return Ok(());
        }
        link.set_remote_description(answer).await?;
        self.mark_remote_description_set();
        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn accept_remote_candidate(&mut self, candidate: IceCandidate) {
        let ready = self
            .peer
            .as_ref()
            .filter(|peer| peer.remote_description_set)
            .map(|peer| Arc::clone(&peer.link));
        match ready {
            Some(link) => {
                if let Err(err) = link.add_ice_candidate(candidate).await {
                    tracing::warn!(target = "call", error = %err, "failed to add remote candidate");
                }
            }
            None => {
                tracing::debug!(
                    target = "call",
                    buffered = self.pending_candidates.len() + 1,
                    "buffering remote candidate until remote description is set"
                );
                self.pending_candidates.push(candidate);
            }
        }
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let Ok((link, _)) = self.active_link() else {
            return;
        };
        let pending = std::mem::take(&mut self.pending_candidates);
        tracing::debug!(target = "call", count = pending.len(), "applying buffered candidates");
        for candidate in pending {
            if let Err(err) = link.add_ice_candidate(candidate).await {
                tracing::warn!(target = "call", error = %err, "failed to add buffered candidate");
            }
        }
    }

    async fn restart_ice(&mut self) {
        if let Some(peer) = self.peer.as_mut() {
            peer.ice_restart = IceRestart::InFlight;
        }
        tracing::info!(target = "call", "ice failed; attempting restart");
        if let Err(err) = self.send_offer(true).await {
            self.surface(&err);
            self.restart_pairing("ice restart failed").await;
        }
    }

    /// Drops the current peer and asks the relay for a new one.
    async fn restart_pairing(&mut self, reason: &str) {
        tracing::info!(target = "call", reason, "tearing down peer connection");
        self.set_phase(CallPhase::Disconnected);
        self.discard_peer().await;
        self.pending_candidates.clear();
        let _ = self.events.send(SessionEvent::RemoteStream(None));
        if let Err(err) = self.relay_send(ClientEvent::FindPeer) {
            self.surface(&err);
        }
        self.set_phase(CallPhase::WaitingForPeer);
    }

    async fn discard_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            if let Err(err) = peer.link.close().await {
                tracing::warn!(target = "call", error = %err, "closing peer connection failed");
            }
            tracing::debug!(
                target = "call",
                generation = peer.generation,
                peer = %peer.remote_name,
                was_connected = peer.link_connected,
                "peer connection closed"
            );
        }
    }

    fn active_link(&self) -> Result<(Arc<dyn PeerLink>, String), CallError> {
        self.peer
            .as_ref()
            .map(|peer| (Arc::clone(&peer.link), peer.remote_name.clone()))
            .ok_or(CallError::InvalidPhase(self.phase.as_str()))
    }

    fn mark_remote_description_set(&mut self) {
        if let Some(peer) = self.peer.as_mut() {
            peer.remote_description_set = true;
        }
    }

    fn relay_send(&self, event: ClientEvent) -> Result<(), CallError> {
        let relay = self
            .relay
            .as_ref()
            .ok_or_else(|| CallError::Relay("not connected to relay".into()))?;
        relay.send(event)
    }

    fn append_chat(&mut self, entry: TranscriptEntry) {
        self.transcript.push(entry.clone());
        let _ = self.events.send(SessionEvent::Chat(entry));
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if self.phase == phase {
            return;
        }
        tracing::info!(target = "call", from = %self.phase, to = %phase, "call phase changed");
        self.phase = phase;
        let _ = self.events.send(SessionEvent::PhaseChanged(phase));
    }

    fn surface(&mut self, err: &CallError) {
        tracing::warn!(target = "call", phase = %self.phase, error = %err, "call error");
        self.last_error = Some(err.to_string());
        let _ = self.events.send(SessionEvent::Error(err.to_string()));
    }

    fn fail(&mut self, err: &CallError) {
        tracing::error!(target = "call", error = %err, "call attempt failed");
        self.last_error = Some(err.to_string());
        let _ = self.events.send(SessionEvent::Error(err.to_string()));
        self.set_phase(CallPhase::Failed);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(media) = self.local_media.take() {
            media.stop_all();
        }
    }
}

async fn next_relay_event(events: &mut Option<RelayEvents>) -> Option<RelayEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
