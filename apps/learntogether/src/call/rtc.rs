//! Native peer connections backed by the `webrtc` crate.

use super::error::CallError;
use super::media::{LocalMedia, TrackKind};
use super::peer::{
    IceState, LinkState, PeerEvent, PeerEventSink, PeerLink, PeerLinkFactory, RemoteTrack,
    SignalingState,
};
use crate::config::IceServerConfig;
use async_trait::async_trait;
use relay_proto::{IceCandidate, SdpKind, SessionDescription};
use std::sync::Arc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerLinkFactory;

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn open(
        &self,
        ice_servers: &[IceServerConfig],
        media: &LocalMedia,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        for track in media.tracks() {
            if let Some(rtc_track) = track.rtc_track() {
                pc.add_track(rtc_track).await?;
                tracing::debug!(
                    target = "call",
                    track = %track.id(),
                    kind = %track.kind(),
                    "attached local track"
                );
            }
        }

        install_handlers(&pc, events);
        Ok(Arc::new(RtcPeerLink { pc }))
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(err) => {
                    tracing::warn!(target = "call", error = %err, "failed to encode local candidate")
                }
            }
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                sink.emit(PeerEvent::RemoteTrack {
                    stream_id: track.stream_id(),
                    track: RemoteTrack {
                        id: track.id(),
                        kind,
                    },
                });
            })
        },
    ));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match state {
                RTCPeerConnectionState::New => LinkState::New,
                RTCPeerConnectionState::Connecting => LinkState::Connecting,
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
                _ => return,
            };
            sink.emit(PeerEvent::ConnectionState(state));
        })
    }));

    let sink = events;
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match state {
                RTCIceConnectionState::New => IceState::New,
                RTCIceConnectionState::Checking => IceState::Checking,
                RTCIceConnectionState::Connected => IceState::Connected,
                RTCIceConnectionState::Completed => IceState::Completed,
                RTCIceConnectionState::Disconnected => IceState::Disconnected,
                RTCIceConnectionState::Failed => IceState::Failed,
                RTCIceConnectionState::Closed => IceState::Closed,
                _ => return,
            };
            sink.emit(PeerEvent::IceState(state));
        })
    }));
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, CallError> {
    let described = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(CallError::Negotiation(
                "rollback descriptions are not supported".into(),
            ));
        }
    };
    Ok(described?)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, CallError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(CallError::Negotiation(format!(
                "unexpected description type {other}"
            )));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}
