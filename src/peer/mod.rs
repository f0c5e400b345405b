//! Peer-connection primitive and the per-participant link state machine.

mod link;
pub mod rtc;

pub(crate) use link::{spawn_link, LinkCommand, LinkContext, LinkHandle};

use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Aggregate state reported by the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events pushed by a peer connection to its link.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack { kind: TrackKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Recovering,
    Closed,
}

impl LinkState {
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Offering) | (Idle, Answering) => true,
            (Offering, AwaitingAnswer) => true,
            (AwaitingAnswer, Connected) | (Answering, Connected) => true,
            (Recovering, Connected) => true,
            (Offering | AwaitingAnswer | Answering | Connected, Recovering) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::AwaitingAnswer => "awaiting-answer",
            LinkState::Answering => "answering",
            LinkState::Connected => "connected",
            LinkState::Recovering => "recovering",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One peer-to-peer media session with a single remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Swaps the track on the existing sender of `kind`. No renegotiation.
    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<()>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Discards the pending local offer so a remote offer can be applied.
    async fn rollback(&self) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn connection_state(&self) -> PeerConnectionState;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Creates a connection towards `remote`; its events go to `events`.
    async fn create(
        &self,
        remote: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
