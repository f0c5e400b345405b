//! In-memory fakes for the peer-connection primitive and the signaling channel.

use crate::media::{LocalTrack, TrackKind};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};
use crate::room::{SignalingRelay, TransportHandle};
use crate::signaling::{ClientMessage, IceCandidate, SdpKind, SessionDescription, SignalChannel, SignalSender};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeState {
    state: Option<PeerConnectionState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    sending: HashMap<TrackKind, String>,
    replaced: Vec<(TrackKind, String)>,
    offers: u32,
    ice_restarts: u32,
    rollbacks: u32,
    candidates: Vec<IceCandidate>,
    awaiting_answer: bool,
    tracks_announced: bool,
    closed: bool,
}

/// Peer connection that "connects" as soon as an offer/answer pair is applied.
pub struct FakePeerConnection {
    remote: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<FakeState>,
    fail_offers: AtomicBool,
}

impl FakePeerConnection {
    pub fn new(remote: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_events(remote, tx), rx)
    }

    pub fn with_events(remote: &str, events: mpsc::UnboundedSender<PeerEvent>) -> Arc<Self> {
        Arc::new(Self {
            remote: remote.to_string(),
            events,
            state: Mutex::new(FakeState::default()),
            fail_offers: AtomicBool::new(false),
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Pushes a connection state change as the primitive would.
    pub fn simulate_state(&self, state: PeerConnectionState) {
        self.state.lock().state = Some(state);
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    /// Changes the reported state without emitting an event.
    pub fn set_state_silently(&self, state: PeerConnectionState) {
        self.state.lock().state = Some(state);
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn sending(&self, kind: TrackKind) -> Option<String> {
        self.state.lock().sending.get(&kind).cloned()
    }

    pub fn replaced_tracks(&self) -> Vec<(TrackKind, String)> {
        self.state.lock().replaced.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers
    }

    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().ice_restarts
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn connect(&self, state: &mut FakeState) {
        if state.closed || state.state == Some(PeerConnectionState::Connected) {
            return;
        }
        state.state = Some(PeerConnectionState::Connected);
        let _ = self.events.send(PeerEvent::StateChanged(PeerConnectionState::Connected));
        if !state.tracks_announced {
            state.tracks_announced = true;
            for kind in [TrackKind::Audio, TrackKind::Video] {
                let _ = self.events.send(PeerEvent::RemoteTrack { kind });
            }
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.state.lock().sending.insert(track.kind(), track.id().to_string());
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<()> {
        let mut state = self.state.lock();
        if !state.sending.contains_key(&kind) {
            return Err(Error::PeerConnection(format!("no {} sender", kind)));
        }
        state.sending.insert(kind, track.id().to_string());
        state.replaced.push((kind, track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(Error::PeerConnection("offer generation failed".into()));
        }
        let mut state = self.state.lock();
        state.offers += 1;
        if ice_restart {
            state.ice_restarts += 1;
        }
        Ok(SessionDescription::offer(format!(
            "v=0 offer#{} to {} restart={}",
            state.offers, self.remote, ice_restart
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        if state.remote.as_ref().map(|d| d.kind) != Some(SdpKind::Offer) {
            return Err(Error::PeerConnection("no remote offer to answer".into()));
        }
        Ok(SessionDescription::answer(format!("v=0 answer to {}", self.remote)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        let kind = desc.kind;
        state.local = Some(desc);
        if state.state.is_none() {
            state.state = Some(PeerConnectionState::Connecting);
        }
        let _ = self.events.send(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:fake 1 udp 1 127.0.0.1 9 typ host ({})", self.remote),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        match kind {
            SdpKind::Offer => state.awaiting_answer = true,
            SdpKind::Answer => {
                if state.remote.as_ref().map(|d| d.kind) == Some(SdpKind::Offer) {
                    self.connect(&mut state);
                }
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        if desc.kind == SdpKind::Answer && !state.awaiting_answer {
            return Err(Error::PeerConnection("answer without a local offer".into()));
        }
        let kind = desc.kind;
        state.remote = Some(desc);
        state.awaiting_answer = false;
        if kind == SdpKind::Answer {
            self.connect(&mut state);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.awaiting_answer {
            return Err(Error::PeerConnection("no local offer to roll back".into()));
        }
        state.awaiting_answer = false;
        state.rollbacks += 1;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::PeerConnection("remote description not set".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().state.unwrap_or(PeerConnectionState::New)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.state = Some(PeerConnectionState::Closed);
        Ok(())
    }
}

/// Hands out [`FakePeerConnection`]s and remembers each one.
#[derive(Default)]
pub struct FakePeerConnectionFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    fail: AtomicBool,
    fail_offers: AtomicBool,
}

impl FakePeerConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_creation(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Connections created from now on fail to generate offers.
    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    /// Every connection created towards `remote`, oldest first.
    pub fn connections_to(&self, remote: &str) -> Vec<Arc<FakePeerConnection>> {
        self.created
            .lock()
            .iter()
            .filter(|pc| pc.remote() == remote)
            .cloned()
            .collect()
    }

    pub fn latest(&self, remote: &str) -> Option<Arc<FakePeerConnection>> {
        self.connections_to(remote).pop()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerConnectionFactory {
    async fn create(
        &self,
        remote: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::PeerConnection("factory disabled".into()));
        }
        let pc = FakePeerConnection::with_events(remote, events);
        pc.fail_offers(self.fail_offers.load(Ordering::SeqCst));
        self.created.lock().push(Arc::clone(&pc));
        Ok(pc)
    }
}

/// Signaling channel that records every message and can forward it into a
/// [`SignalingRelay`] as if sent over the wire.
#[derive(Default)]
pub struct RecordingSignal {
    sent: Mutex<Vec<ClientMessage>>,
    down: AtomicBool,
    reconnects: AtomicU32,
    forward: Option<(Arc<SignalingRelay>, TransportHandle)>,
}

impl RecordingSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn forwarding(relay: Arc<SignalingRelay>, transport: TransportHandle) -> Arc<Self> {
        Arc::new(Self {
            forward: Some((relay, transport)),
            ..Self::default()
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl SignalSender for RecordingSignal {
    fn send(&self, message: ClientMessage) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::ChannelDown);
        }
        self.sent.lock().push(message.clone());
        if let Some((relay, transport)) = &self.forward {
            relay.handle(transport, message);
        }
        Ok(())
    }
}

impl SignalChannel for RecordingSignal {
    fn request_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}
