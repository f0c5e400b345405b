//! Routes handshake and toggle messages between participants of a room.

use super::registry::{LeaveOutcome, RoomRegistry, TransportHandle, TransportId};
use crate::signaling::{
    ClientMessage, IceCandidate, ParticipantId, ParticipantSummary, RoomId, ServerMessage,
    SessionDescription, StateKind,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A handshake payload addressed to one participant.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl RoutedPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RoutedPayload::Offer(_) => "offer",
            RoutedPayload::Answer(_) => "answer",
            RoutedPayload::IceCandidate(_) => "ice-candidate",
        }
    }

    fn into_message(self, sender: ParticipantId) -> ServerMessage {
        match self {
            RoutedPayload::Offer(sdp) => ServerMessage::Offer {
                sdp,
                sender_participant_id: sender,
            },
            RoutedPayload::Answer(sdp) => ServerMessage::Answer {
                sdp,
                sender_participant_id: sender,
            },
            RoutedPayload::IceCandidate(candidate) => ServerMessage::IceCandidate {
                candidate,
                sender_participant_id: sender,
            },
        }
    }
}

/// Why a routed message was dropped. Logged by the relay, never sent back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("room {0} does not exist")]
    UnknownRoom(RoomId),
    #[error("participant {target} is not in room {room}")]
    UnknownTarget { room: RoomId, target: ParticipantId },
    #[error("transport of participant {0} is gone")]
    TransportGone(ParticipantId),
    #[error("transport {0} has not joined a room")]
    NotJoined(TransportId),
    #[error("sender is in room {actual}, message names room {claimed}")]
    RoomMismatch { claimed: RoomId, actual: RoomId },
}

pub struct SignalingRelay {
    registry: Arc<RoomRegistry>,
}

impl SignalingRelay {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Dispatches one decoded client frame arriving on `transport`.
    pub fn handle(&self, transport: &TransportHandle, message: ClientMessage) {
        let kind = message.kind();
        match message {
            ClientMessage::JoinRoom {
                room_id,
                participant_id,
                display_name,
            } => {
                self.join(&room_id, &participant_id, &display_name, transport.clone());
            }
            ClientMessage::LeaveRoom => self.leave(transport.id()),
            ClientMessage::Ping => {
                transport.send(ServerMessage::Pong);
            }
            ClientMessage::Offer {
                target_participant_id,
                sdp,
                room_id,
            } => self.route_from(transport, &room_id, &target_participant_id, RoutedPayload::Offer(sdp)),
            ClientMessage::Answer {
                target_participant_id,
                sdp,
                room_id,
            } => self.route_from(transport, &room_id, &target_participant_id, RoutedPayload::Answer(sdp)),
            ClientMessage::IceCandidate {
                target_participant_id,
                candidate,
                room_id,
            } => self.route_from(
                transport,
                &room_id,
                &target_participant_id,
                RoutedPayload::IceCandidate(candidate),
            ),
            ClientMessage::ToggleVideo { room_id, state } => {
                self.toggle_from(transport, &room_id, StateKind::Video, state, kind)
            }
            ClientMessage::ToggleAudio { room_id, state } => {
                self.toggle_from(transport, &room_id, StateKind::Audio, state, kind)
            }
            ClientMessage::ToggleScreenShare { room_id, state } => {
                self.toggle_from(transport, &room_id, StateKind::ScreenShare, state, kind)
            }
        }
    }

    /// Registers the participant, replies with the roster and tells the room.
    ///
    /// The roster reply and the notifications go out under the room lock: the
    /// newcomer always hears its roster before any later `user-joined`, and
    /// the room never hears of a join after the matching leave.
    pub fn join(
        &self,
        room_id: &str,
        participant_id: &str,
        display_name: &str,
        transport: TransportHandle,
    ) -> Vec<ParticipantSummary> {
        // A transport holds one session; leaving the previous one first lets
        // its room hear about it.
        if let Some(key) = self.registry.session_of(transport.id()) {
            if key.room_id != room_id || key.participant_id != participant_id {
                self.leave(transport.id());
            }
        }

        let outcome = self.registry.join_with(
            room_id,
            participant_id,
            display_name,
            transport.clone(),
            |outcome| {
                if let Some(old) = &outcome.replaced {
                    let gone = ServerMessage::UserLeft {
                        participant_id: old.participant_id.clone(),
                        display_name: old.display_name.clone(),
                    };
                    for other in &outcome.others {
                        other.send(gone.clone());
                    }
                }

                transport.send(ServerMessage::RoomParticipants {
                    participants: outcome.roster.clone(),
                });

                let joined = ServerMessage::UserJoined {
                    participant_id: participant_id.to_string(),
                    display_name: display_name.to_string(),
                };
                for other in &outcome.others {
                    other.send(joined.clone());
                }
            },
        );

        if outcome.replaced.as_ref().is_some_and(|old| old.transport.id() != transport.id()) {
            debug!(room = room_id, participant = participant_id, "rejoin replaced prior session");
        }
        info!(
            room = room_id,
            participant = participant_id,
            transport = transport.id(),
            peers = outcome.roster.len(),
            "participant joined"
        );
        outcome.roster
    }

    pub fn leave(&self, transport_id: TransportId) {
        match self.registry.leave_with(transport_id, announce_left) {
            Some(outcome) => info!(
                room = %outcome.room_id,
                participant = %outcome.session.participant_id,
                room_deleted = outcome.room_deleted,
                "participant left"
            ),
            None => debug!(transport = transport_id, "leave for transport without session"),
        }
    }

    /// Forwards a handshake payload to `target` only. Never errors toward the sender.
    pub fn route(
        &self,
        room_id: &str,
        sender: &str,
        target: &str,
        payload: RoutedPayload,
    ) -> Result<(), RoutingError> {
        let handle = self
            .registry
            .with_room(room_id, |room| room.get(target).map(|s| s.transport.clone()))
            .ok_or_else(|| RoutingError::UnknownRoom(room_id.to_string()))?
            .ok_or_else(|| RoutingError::UnknownTarget {
                room: room_id.to_string(),
                target: target.to_string(),
            })?;

        let kind = payload.kind();
        if !handle.send(payload.into_message(sender.to_string())) {
            return Err(RoutingError::TransportGone(target.to_string()));
        }
        debug!(room = room_id, sender, target, kind, "routed");
        Ok(())
    }

    /// Sends a toggle event to every other participant. Nothing is stored.
    pub fn broadcast_state(&self, room_id: &str, sender: &str, kind: StateKind, state: bool) {
        let targets = self
            .registry
            .with_room(room_id, |room| {
                room.others(sender)
                    .map(|s| s.transport.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let event = ServerMessage::state_toggled(kind, sender.to_string(), state);
        for target in &targets {
            target.send(event.clone());
        }
        debug!(room = room_id, sender, ?kind, state, recipients = targets.len(), "state broadcast");
    }

    fn route_from(
        &self,
        transport: &TransportHandle,
        room_id: &str,
        target: &str,
        payload: RoutedPayload,
    ) {
        let kind = payload.kind();
        let result = self
            .sender_in(transport, room_id)
            .and_then(|sender| self.route(room_id, &sender, target, payload));
        if let Err(e) = result {
            warn!(room = room_id, target, kind, error = %e, "dropping signaling message");
        }
    }

    fn toggle_from(
        &self,
        transport: &TransportHandle,
        room_id: &str,
        state_kind: StateKind,
        state: bool,
        kind: &str,
    ) {
        match self.sender_in(transport, room_id) {
            Ok(sender) => self.broadcast_state(room_id, &sender, state_kind, state),
            Err(e) => warn!(room = room_id, kind, error = %e, "dropping toggle"),
        }
    }

    /// Sender identity comes from the transport's session, never from the payload.
    fn sender_in(&self, transport: &TransportHandle, room_id: &str) -> Result<ParticipantId, RoutingError> {
        let key = self
            .registry
            .session_of(transport.id())
            .ok_or(RoutingError::NotJoined(transport.id()))?;
        if key.room_id != room_id {
            return Err(RoutingError::RoomMismatch {
                claimed: room_id.to_string(),
                actual: key.room_id,
            });
        }
        Ok(key.participant_id)
    }

}

fn announce_left(outcome: &LeaveOutcome) {
    let left = ServerMessage::UserLeft {
        participant_id: outcome.session.participant_id.clone(),
        display_name: outcome.session.display_name.clone(),
    };
    for other in &outcome.others {
        other.send(left.clone());
    }
}
