//! In-memory mesh: call sessions talking through a real `SignalingRelay`
//! with fake peer connections.

#![allow(dead_code)]

use mesh_call::config::ClientConfig;
use mesh_call::media::SyntheticDevices;
use mesh_call::peer::LinkState;
use mesh_call::room::{RoomRegistry, SignalingRelay, Transport};
use mesh_call::testing::{FakePeerConnectionFactory, RecordingSignal};
use mesh_call::{CallEvent, CallSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Long enough for the settle delay and a full offer/answer exchange.
pub const NEGOTIATION: Duration = Duration::from_millis(1500);

pub struct TestPeer {
    pub id: String,
    pub session: Arc<CallSession>,
    pub signal: Arc<RecordingSignal>,
    pub factory: Arc<FakePeerConnectionFactory>,
    pub devices: Arc<SyntheticDevices>,
    transport: Option<Transport>,
}

impl TestPeer {
    pub async fn link_state(&self, remote: &str) -> Option<LinkState> {
        self.session.orchestrator().link_state(remote).await
    }

    /// Every offer this peer generated, across all of its connections.
    pub fn offers_created(&self) -> u32 {
        ["a", "b", "c", "d"]
            .iter()
            .flat_map(|remote| self.factory.connections_to(remote))
            .map(|pc| pc.offers_created())
            .sum()
    }

    /// Drops the transport without a `leave-room`, as a crashed client would.
    pub fn drop_connection(&mut self, relay: &SignalingRelay) {
        if let Some(transport) = self.transport.take() {
            relay.leave(transport.id());
        }
    }
}

pub struct TestMesh {
    pub relay: Arc<SignalingRelay>,
}

impl TestMesh {
    pub fn new() -> Self {
        Self {
            relay: Arc::new(SignalingRelay::new(Arc::new(RoomRegistry::new()))),
        }
    }

    pub async fn join(&self, room: &str, id: &str) -> TestPeer {
        self.join_with(room, id, |_| {}).await
    }

    /// Joins after letting the caller adjust the client config.
    pub async fn join_with(&self, room: &str, id: &str, configure: impl FnOnce(&mut ClientConfig)) -> TestPeer {
        let (transport, inbound) = Transport::new();
        let signal = RecordingSignal::forwarding(self.relay.clone(), transport.handle());
        let factory = FakePeerConnectionFactory::new();
        let devices = Arc::new(SyntheticDevices::new());
        let mut config = ClientConfig {
            room_id: room.into(),
            participant_id: id.into(),
            display_name: id.to_uppercase(),
            ..ClientConfig::default()
        };
        configure(&mut config);
        let session = CallSession::join_over(config, devices.clone(), factory.clone(), signal.clone(), inbound)
            .await
            .expect("join");
        TestPeer {
            id: id.to_string(),
            session,
            signal,
            factory,
            devices,
            transport: Some(transport),
        }
    }

    pub fn roster(&self, room: &str) -> Vec<String> {
        self.relay.registry().roster(room)
    }
}

pub fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
