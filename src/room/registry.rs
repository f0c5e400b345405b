//! Room → participant registry owned by the relay.

use crate::signaling::{ParticipantId, ParticipantSummary, RoomId, ServerMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type TransportId = u64;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// The owning side of a relay→client message channel.
///
/// The connection task keeps this alive; the registry only ever sees a
/// [`TransportHandle`], so dropping the connection makes every handle dead.
pub struct Transport {
    id: TransportId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Transport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            id: self.id,
            tx: self.tx.downgrade(),
        }
    }
}

/// Weak reference to a participant's transport.
#[derive(Clone)]
pub struct TransportHandle {
    id: TransportId,
    tx: mpsc::WeakUnboundedSender<ServerMessage>,
}

impl TransportHandle {
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Delivers if the transport is still alive; reports whether it was.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaState {
    pub video_on: bool,
    pub audio_on: bool,
    pub screen_sharing: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            video_on: true,
            audio_on: true,
            screen_sharing: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantSession {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub transport: TransportHandle,
    /// State declared at join. Toggles are relayed as events and not stored.
    pub media_state: MediaState,
}

impl ParticipantSession {
    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

pub struct Room {
    pub id: RoomId,
    participants: HashMap<ParticipantId, ParticipantSession>,
    /// Set when the room emptied and was unlinked from the registry.
    retired: bool,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            participants: HashMap::new(),
            retired: false,
        }
    }

    pub fn get(&self, participant_id: &str) -> Option<&ParticipantSession> {
        self.participants.get(participant_id)
    }

    /// Every session except `excluded`.
    pub fn others<'a>(
        &'a self,
        excluded: &'a str,
    ) -> impl Iterator<Item = &'a ParticipantSession> + 'a {
        self.participants
            .values()
            .filter(move |session| session.participant_id != excluded)
    }
}

#[derive(Debug, Clone)]
pub struct SessionKey {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
}

/// Result of a join, for the relay to fan out notifications.
#[derive(Debug)]
pub struct JoinOutcome {
    pub roster: Vec<ParticipantSummary>,
    pub others: Vec<TransportHandle>,
    /// Prior session under the same participant id that this join replaced.
    pub replaced: Option<ParticipantSession>,
    /// Session the transport held elsewhere before this join.
    pub left_elsewhere: Option<LeaveOutcome>,
}

#[derive(Debug)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    pub session: ParticipantSession,
    pub others: Vec<TransportHandle>,
    pub room_deleted: bool,
}

/// Authoritative room membership.
///
/// Each room sits behind its own lock so rooms never contend with each other;
/// the room map and the transport index are only held for lookups.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<Mutex<Room>>>>,
    transports: Mutex<HashMap<TransportId, SessionKey>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &self,
        room_id: &str,
        participant_id: &str,
        display_name: &str,
        transport: TransportHandle,
    ) -> JoinOutcome {
        self.join_with(room_id, participant_id, display_name, transport, |_| {})
    }

    /// Like [`RoomRegistry::join`]; `announce` runs with the room still
    /// locked, so its messages are ordered against every other membership
    /// change of the room.
    pub fn join_with(
        &self,
        room_id: &str,
        participant_id: &str,
        display_name: &str,
        transport: TransportHandle,
        announce: impl FnOnce(&JoinOutcome),
    ) -> JoinOutcome {
        // A transport holds at most one session.
        let left_elsewhere = match self.session_of(transport.id()) {
            Some(key) if key.room_id != room_id || key.participant_id != participant_id => {
                self.leave(transport.id())
            }
            _ => None,
        };

        loop {
            let room = self.room_entry(room_id);
            let mut room = room.lock();
            if room.retired {
                // Emptied and unlinked between lookup and lock; fetch the new one.
                continue;
            }

            let session = ParticipantSession {
                participant_id: participant_id.to_string(),
                display_name: display_name.to_string(),
                transport: transport.clone(),
                media_state: MediaState::default(),
            };
            let replaced = room.participants.insert(participant_id.to_string(), session);

            {
                let mut transports = self.transports.lock();
                if let Some(old) = &replaced {
                    if old.transport.id() != transport.id() {
                        transports.remove(&old.transport.id());
                    }
                }
                transports.insert(
                    transport.id(),
                    SessionKey {
                        room_id: room_id.to_string(),
                        participant_id: participant_id.to_string(),
                    },
                );
            }

            let others: Vec<_> = room.others(participant_id).collect();
            let outcome = JoinOutcome {
                roster: others.iter().map(|s| s.summary()).collect(),
                others: others.iter().map(|s| s.transport.clone()).collect(),
                replaced,
                left_elsewhere,
            };
            announce(&outcome);
            return outcome;
        }
    }

    /// Removes whatever session the transport owns. A second call is a no-op.
    pub fn leave(&self, transport_id: TransportId) -> Option<LeaveOutcome> {
        self.leave_with(transport_id, |_| {})
    }

    /// Like [`RoomRegistry::leave`], running `announce` under the room lock.
    pub fn leave_with(
        &self,
        transport_id: TransportId,
        announce: impl FnOnce(&LeaveOutcome),
    ) -> Option<LeaveOutcome> {
        let key = self.session_of(transport_id)?;
        let room = self.rooms.lock().get(&key.room_id).cloned()?;
        let mut room = room.lock();

        let owned_by_transport = room
            .participants
            .get(&key.participant_id)
            .is_some_and(|s| s.transport.id() == transport_id);
        if !owned_by_transport {
            self.transports.lock().remove(&transport_id);
            return None;
        }

        let session = room.participants.remove(&key.participant_id)?;
        self.transports.lock().remove(&transport_id);

        let room_deleted = room.participants.is_empty();
        if room_deleted {
            room.retired = true;
            self.rooms.lock().remove(&key.room_id);
        }

        let outcome = LeaveOutcome {
            room_id: key.room_id,
            others: room.others(&session.participant_id).map(|s| s.transport.clone()).collect(),
            session,
            room_deleted,
        };
        announce(&outcome);
        Some(outcome)
    }

    pub fn session_of(&self, transport_id: TransportId) -> Option<SessionKey> {
        self.transports.lock().get(&transport_id).cloned()
    }

    /// Runs `f` with the room locked, if the room exists.
    pub fn with_room<R>(&self, room_id: &str, f: impl FnOnce(&Room) -> R) -> Option<R> {
        let room = self.rooms.lock().get(room_id).cloned()?;
        let room = room.lock();
        if room.retired {
            return None;
        }
        Some(f(&room))
    }

    pub fn roster(&self, room_id: &str) -> Vec<ParticipantId> {
        let mut ids = self
            .with_room(room_id, |room| room.participants.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.lock().contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    fn room_entry(&self, room_id: &str) -> Arc<Mutex<Room>> {
        let mut rooms = self.rooms.lock();
        Arc::clone(
            rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id.to_string())))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (Transport, mpsc::UnboundedReceiver<ServerMessage>) {
        Transport::new()
    }

    #[test]
    fn test_first_join_creates_room_with_empty_roster() {
        let registry = RoomRegistry::new();
        let (a, _rx) = transport();

        let outcome = registry.join("R1", "a", "Ann", a.handle());
        assert!(outcome.roster.is_empty());
        assert!(outcome.replaced.is_none());
        assert!(registry.contains_room("R1"));
        assert_eq!(registry.roster("R1"), vec!["a"]);
    }

    #[test]
    fn test_roster_excludes_caller() {
        let registry = RoomRegistry::new();
        let (a, _ra) = transport();
        let (b, _rb) = transport();
        registry.join("R1", "a", "Ann", a.handle());

        let outcome = registry.join("R1", "b", "Bob", b.handle());
        assert_eq!(outcome.roster.len(), 1);
        assert_eq!(outcome.roster[0].participant_id, "a");
        assert_eq!(outcome.others.len(), 1);
        assert_eq!(outcome.others[0].id(), a.id());
    }

    #[test]
    fn test_leave_is_idempotent_and_deletes_empty_room() {
        let registry = RoomRegistry::new();
        let (a, _ra) = transport();
        let (b, _rb) = transport();
        registry.join("R1", "a", "Ann", a.handle());
        registry.join("R1", "b", "Bob", b.handle());

        let first = registry.leave(b.id()).unwrap();
        assert_eq!(first.session.participant_id, "b");
        assert!(!first.room_deleted);
        assert!(registry.leave(b.id()).is_none());
        assert_eq!(registry.roster("R1"), vec!["a"]);

        let last = registry.leave(a.id()).unwrap();
        assert!(last.room_deleted);
        assert!(!registry.contains_room("R1"));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_rejoin_replaces_prior_session() {
        let registry = RoomRegistry::new();
        let (old, _ro) = transport();
        let (new, _rn) = transport();
        registry.join("R1", "a", "Ann", old.handle());

        let outcome = registry.join("R1", "a", "Ann (phone)", new.handle());
        assert_eq!(outcome.replaced.unwrap().transport.id(), old.id());
        assert_eq!(registry.roster("R1"), vec!["a"]);

        // The replaced transport no longer owns anything.
        assert!(registry.leave(old.id()).is_none());
        assert_eq!(registry.roster("R1"), vec!["a"]);
        assert!(registry.leave(new.id()).unwrap().room_deleted);
    }

    #[test]
    fn test_join_other_room_leaves_previous() {
        let registry = RoomRegistry::new();
        let (a, _ra) = transport();
        registry.join("R1", "a", "Ann", a.handle());

        let outcome = registry.join("R2", "a", "Ann", a.handle());
        let left = outcome.left_elsewhere.unwrap();
        assert_eq!(left.room_id, "R1");
        assert!(left.room_deleted);
        assert!(!registry.contains_room("R1"));
        assert_eq!(registry.roster("R2"), vec!["a"]);
    }

    #[test]
    fn test_announce_runs_while_room_is_locked() {
        let registry = RoomRegistry::new();
        let (a, _ra) = transport();
        let (b, _rb) = transport();
        registry.join("R1", "a", "Ann", a.handle());

        let mut seen = None;
        registry.join_with("R1", "b", "Bob", b.handle(), |outcome| {
            // Only the room itself is locked here.
            assert!(registry.contains_room("R1"));
            seen = Some(outcome.roster.len());
        });
        assert_eq!(seen, Some(1));

        let mut left = None;
        registry.leave_with(b.id(), |outcome| left = Some(outcome.session.participant_id.clone()));
        assert_eq!(left.as_deref(), Some("b"));
    }

    #[test]
    fn test_dead_transport_handle_drops_messages() {
        let (a, rx) = transport();
        let handle = a.handle();
        assert!(handle.send(ServerMessage::Pong));
        drop(rx);
        assert!(!handle.send(ServerMessage::Pong));

        let (b, _rb) = transport();
        let handle = b.handle();
        drop(b);
        assert!(!handle.send(ServerMessage::Pong));
    }

    #[test]
    fn test_roster_matches_live_sessions_across_sequence() {
        let registry = RoomRegistry::new();
        let transports: Vec<_> = (0..6).map(|_| transport()).collect();
        let ids = ["a", "b", "c", "d", "e", "f"];

        for ((t, _), id) in transports.iter().zip(ids) {
            registry.join("R1", id, id, t.handle());
        }
        for idx in [1, 3, 3, 5] {
            registry.leave(transports[idx].0.id());
        }
        assert_eq!(registry.roster("R1"), vec!["a", "c", "e"]);

        for idx in [0, 2, 4] {
            registry.leave(transports[idx].0.id());
        }
        assert!(registry.roster("R1").is_empty());
        assert!(!registry.contains_room("R1"));
    }
}
