//! Full-mesh WebRTC calls: a WebSocket signaling relay that tracks rooms and
//! routes handshake messages, and a client that keeps one peer link per
//! remote participant alive.

pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod room;
pub mod signaling;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use call::CallSession;
pub use error::{Error, Result};
pub use orchestrator::{CallEvent, ConnectionOrchestrator};
