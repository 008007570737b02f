//! Wire definitions for the learntogether relay.
//!
//! Every socket frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Kept in a dedicated crate so relay implementations and tooling can share
//! the shapes without pulling in the WebRTC stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// A persisted conversation message as stored by the message API and
/// broadcast to the conversation room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Body of a message creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub recipient_id: String,
    pub text: String,
}

/// Frames sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Register {
        name: String,
    },
    Offer {
        offer: SessionDescription,
        to: String,
    },
    Answer {
        answer: SessionDescription,
        to: String,
    },
    IceCandidate {
        candidate: IceCandidate,
        to: String,
    },
    ChatMessage {
        sender: String,
        text: String,
    },
    FindPeer,
    #[serde(rename = "chat:join", rename_all = "camelCase")]
    ChatJoin {
        conversation_id: String,
    },
    #[serde(rename = "chat:message")]
    ChatBroadcast(ChatMessage),
}

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Registered, no peer available yet.
    Waiting,
    /// A peer joined after us; we initiate.
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer_id: String,
        peer_name: String,
    },
    /// We were paired with a peer that was already waiting; it initiates.
    #[serde(rename_all = "camelCase")]
    PeerReady {
        peer_id: String,
        peer_name: String,
    },
    OfferReceived {
        offer: SessionDescription,
        from: String,
    },
    AnswerReceived {
        answer: SessionDescription,
    },
    IceCandidateReceived {
        candidate: IceCandidate,
    },
    PeerDisconnected,
    ChatMessage {
        sender: String,
        text: String,
    },
    #[serde(rename = "chat:message")]
    ChatBroadcast(ChatMessage),
    Error {
        message: String,
    },
}

impl ClientEvent {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_frame(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register { .. } => "register",
            ClientEvent::Offer { .. } => "offer",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::ChatMessage { .. } => "chat-message",
            ClientEvent::FindPeer => "find-peer",
            ClientEvent::ChatJoin { .. } => "chat:join",
            ClientEvent::ChatBroadcast(_) => "chat:message",
        }
    }
}

impl RelayEvent {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_frame(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Waiting => "waiting",
            RelayEvent::PeerJoined { .. } => "peer-joined",
            RelayEvent::PeerReady { .. } => "peer-ready",
            RelayEvent::OfferReceived { .. } => "offer-received",
            RelayEvent::AnswerReceived { .. } => "answer-received",
            RelayEvent::IceCandidateReceived { .. } => "ice-candidate-received",
            RelayEvent::PeerDisconnected => "peer-disconnected",
            RelayEvent::ChatMessage { .. } => "chat-message",
            RelayEvent::ChatBroadcast(_) => "chat:message",
            RelayEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn offer_frame_uses_browser_shapes() {
        let frame = ClientEvent::Offer {
            offer: SessionDescription::offer("v=0"),
            to: "bob".into(),
        }
        .to_frame()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"event": "offer", "data": {"offer": {"type": "offer", "sdp": "v=0"}, "to": "bob"}})
        );
    }

    #[test]
    fn pairing_events_use_camel_case_fields() {
        let event = RelayEvent::from_frame(
            r#"{"event":"peer-joined","data":{"peerId":"s-2","peerName":"bob"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            RelayEvent::PeerJoined {
                peer_id: "s-2".into(),
                peer_name: "bob".into()
            }
        );
    }

    #[test]
    fn unit_events_need_no_payload() {
        assert_eq!(
            RelayEvent::from_frame(r#"{"event":"peer-disconnected"}"#).unwrap(),
            RelayEvent::PeerDisconnected
        );
        let find: Value = serde_json::from_str(&ClientEvent::FindPeer.to_frame().unwrap()).unwrap();
        assert_eq!(find["event"], "find-peer");
    }

    #[test]
    fn ice_candidate_keeps_browser_field_names() {
        let event = RelayEvent::from_frame(
            r#"{"event":"ice-candidate-received","data":{"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}}"#,
        )
        .unwrap();
        let RelayEvent::IceCandidateReceived { candidate } = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment, None);
    }

    #[test]
    fn conversation_room_events_use_colon_names() {
        let join: Value = serde_json::from_str(
            &ClientEvent::ChatJoin {
                conversation_id: "b|u1:u2".into(),
            }
            .to_frame()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(join, json!({"event": "chat:join", "data": {"conversationId": "b|u1:u2"}}));

        let inbound = RelayEvent::from_frame(
            r#"{"event":"chat:message","data":{"conversationId":"u1:u2","senderId":"u1","senderName":"Ann","text":"hi","timestamp":"2024-03-01T10:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(inbound.name(), "chat:message");
    }
}
