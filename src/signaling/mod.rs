//! Signaling wire protocol shared by the relay and the client.
//!
//! Every frame is a JSON object tagged by `"type"` with camelCase fields, e.g.
//! `{"type":"join-room","roomId":"R1","participantId":"a","displayName":"Ann"}`.

mod client;

pub use client::SignalingClient;

use crate::Result;
use serde::{Deserialize, Serialize};

pub type RoomId = String;
pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

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

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub participant_id: ParticipantId,
    pub display_name: String,
}

/// Which ephemeral media toggle a participant broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateKind {
    Video,
    Audio,
    ScreenShare,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
        participant_id: ParticipantId,
        display_name: String,
    },
    LeaveRoom,
    Offer {
        target_participant_id: ParticipantId,
        sdp: SessionDescription,
        room_id: RoomId,
    },
    Answer {
        target_participant_id: ParticipantId,
        sdp: SessionDescription,
        room_id: RoomId,
    },
    IceCandidate {
        target_participant_id: ParticipantId,
        candidate: IceCandidate,
        room_id: RoomId,
    },
    ToggleVideo {
        room_id: RoomId,
        state: bool,
    },
    ToggleAudio {
        room_id: RoomId,
        state: bool,
    },
    ToggleScreenShare {
        room_id: RoomId,
        state: bool,
    },
    Ping,
}

impl ClientMessage {
    pub fn toggle(kind: StateKind, room_id: RoomId, state: bool) -> Self {
        match kind {
            StateKind::Video => ClientMessage::ToggleVideo { room_id, state },
            StateKind::Audio => ClientMessage::ToggleAudio { room_id, state },
            StateKind::ScreenShare => ClientMessage::ToggleScreenShare { room_id, state },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom => "leave-room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::ToggleVideo { .. } => "toggle-video",
            ClientMessage::ToggleAudio { .. } => "toggle-audio",
            ClientMessage::ToggleScreenShare { .. } => "toggle-screen-share",
            ClientMessage::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RoomParticipants {
        participants: Vec<ParticipantSummary>,
    },
    UserJoined {
        participant_id: ParticipantId,
        display_name: String,
    },
    UserLeft {
        participant_id: ParticipantId,
        display_name: String,
    },
    Offer {
        sdp: SessionDescription,
        sender_participant_id: ParticipantId,
    },
    Answer {
        sdp: SessionDescription,
        sender_participant_id: ParticipantId,
    },
    IceCandidate {
        candidate: IceCandidate,
        sender_participant_id: ParticipantId,
    },
    UserVideoToggled {
        participant_id: ParticipantId,
        state: bool,
    },
    UserAudioToggled {
        participant_id: ParticipantId,
        state: bool,
    },
    UserScreenShareToggled {
        participant_id: ParticipantId,
        state: bool,
    },
    Pong,
}

impl ServerMessage {
    pub fn state_toggled(kind: StateKind, participant_id: ParticipantId, state: bool) -> Self {
        match kind {
            StateKind::Video => ServerMessage::UserVideoToggled {
                participant_id,
                state,
            },
            StateKind::Audio => ServerMessage::UserAudioToggled {
                participant_id,
                state,
            },
            StateKind::ScreenShare => ServerMessage::UserScreenShareToggled {
                participant_id,
                state,
            },
        }
    }
}

/// Outbound half of the signaling channel.
///
/// Sends never block and never queue: while the channel is down they fail
/// with [`crate::Error::ChannelDown`] and the message is gone.
pub trait SignalSender: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<()>;
}

/// A signaling channel that can be told to drop and re-establish its connection.
pub trait SignalChannel: SignalSender {
    fn request_reconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_format() {
        let msg = ClientMessage::JoinRoom {
            room_id: "R1".into(),
            participant_id: "a".into(),
            display_name: "Ann".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "join-room", "roomId": "R1", "participantId": "a", "displayName": "Ann"})
        );
    }

    #[test]
    fn test_offer_parses_browser_shape() {
        let raw = json!({
            "type": "offer",
            "targetParticipantId": "b",
            "roomId": "R1",
            "sdp": {"type": "offer", "sdp": "v=0"}
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Offer {
                target_participant_id: "b".into(),
                sdp: SessionDescription::offer("v=0"),
                room_id: "R1".into(),
            }
        );
    }

    #[test]
    fn test_candidate_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(ServerMessage::IceCandidate {
            candidate,
            sender_participant_id: "a".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["senderParticipantId"], "a");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert!(value["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn test_toggle_names() {
        let toggled = ServerMessage::state_toggled(StateKind::Audio, "a".into(), false);
        assert_eq!(
            serde_json::to_value(&toggled).unwrap(),
            json!({"type": "user-audio-toggled", "participantId": "a", "state": false})
        );
        let toggle = ClientMessage::toggle(StateKind::ScreenShare, "R1".into(), true);
        assert_eq!(toggle.kind(), "toggle-screen-share");
        assert_eq!(
            serde_json::to_value(&toggle).unwrap()["type"],
            "toggle-screen-share"
        );
    }

    #[test]
    fn test_unit_variants() {
        assert_eq!(
            serde_json::to_value(ClientMessage::Ping).unwrap(),
            json!({"type": "ping"})
        );
        let pong: ServerMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, ServerMessage::Pong);
    }
}
