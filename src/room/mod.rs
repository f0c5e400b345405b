//! Relay side: room membership, message routing and the WebSocket server.

mod registry;
mod relay;
mod server;

pub use registry::{
    JoinOutcome, LeaveOutcome, MediaState, ParticipantSession, Room, RoomRegistry, SessionKey,
    Transport, TransportHandle, TransportId,
};
pub use relay::{RoutedPayload, RoutingError, SignalingRelay};
pub use server::RelayServer;
