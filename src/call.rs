//! One participant in one room: media, signaling, peer links and heartbeat
//! wired together.

use crate::config::ClientConfig;
use crate::connection::ConnectionStatus;
use crate::heartbeat::HeartbeatMonitor;
use crate::media::{LocalMedia, LocalTrack, MediaCaptureManager, MediaDevices, QualityProfile};
use crate::orchestrator::{CallEvent, ConnectionOrchestrator};
use crate::peer::PeerConnectionFactory;
use crate::signaling::{ClientMessage, ServerMessage, SignalChannel, SignalSender, SignalingClient, StateKind};
use crate::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct SessionTasks {
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    sharing: Option<JoinHandle<()>>,
}

pub struct CallSession {
    config: ClientConfig,
    media: Arc<MediaCaptureManager>,
    orchestrator: Arc<ConnectionOrchestrator>,
    heartbeat: Arc<HeartbeatMonitor>,
    sender: Arc<dyn SignalSender>,
    client: Option<Arc<SignalingClient>>,
    tasks: Mutex<SessionTasks>,
    left: AtomicBool,
}

impl CallSession {
    /// Acquires local media, connects to the relay and joins the configured room.
    ///
    /// Media failure is fatal and nothing is sent to the relay.
    pub async fn join(
        config: ClientConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let profile = QualityProfile::named(&config.quality_profile)?;
        let media = MediaCaptureManager::new(devices, Arc::new(LocalMedia::new()));
        media.acquire_local_media(&profile).await?;

        let (client, inbound) =
            match SignalingClient::connect(&config.signaling_url, config.reconnect.clone()).await {
                Ok(connected) => connected,
                Err(e) => {
                    media.stop_all().await;
                    return Err(e);
                }
            };
        Self::start(
            config,
            media,
            factory,
            client.clone(),
            client.clone(),
            inbound,
            Some(client),
        )
        .await
    }

    /// Like [`CallSession::join`] over an already established signaling channel.
    pub async fn join_over<C: SignalChannel + 'static>(
        config: ClientConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        channel: Arc<C>,
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let profile = QualityProfile::named(&config.quality_profile)?;
        let media = MediaCaptureManager::new(devices, Arc::new(LocalMedia::new()));
        media.acquire_local_media(&profile).await?;
        Self::start(config, media, factory, channel.clone(), channel, inbound, None).await
    }

    async fn start(
        config: ClientConfig,
        media: Arc<MediaCaptureManager>,
        factory: Arc<dyn PeerConnectionFactory>,
        sender: Arc<dyn SignalSender>,
        channel: Arc<dyn SignalChannel>,
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
        client: Option<Arc<SignalingClient>>,
    ) -> Result<Arc<Self>> {
        let orchestrator = ConnectionOrchestrator::new(
            config.participant_id.clone(),
            config.room_id.clone(),
            factory,
            sender.clone(),
            media.hub().clone(),
            config.timing.clone(),
        );
        let heartbeat =
            HeartbeatMonitor::new(config.timing.heartbeat_interval(), config.timing.heartbeat_timeout());

        let session = Arc::new(Self {
            config,
            media,
            orchestrator,
            heartbeat,
            sender,
            client,
            tasks: Mutex::new(SessionTasks::default()),
            left: AtomicBool::new(false),
        });

        let join = ClientMessage::JoinRoom {
            room_id: session.config.room_id.clone(),
            participant_id: session.config.participant_id.clone(),
            display_name: session.config.display_name.clone(),
        };
        session.orchestrator.expect_roster();
        let sent = match &session.client {
            Some(client) => client.send_join(join),
            None => session.sender.send(join),
        };
        if let Err(e) = sent {
            warn!(error = %e, "failed to send join");
            session.leave().await;
            return Err(e);
        }

        session.orchestrator.start_health_sweep();
        {
            let mut tasks = session.tasks.lock();
            tasks.pump = Some(tokio::spawn(pump(
                inbound,
                session.orchestrator.clone(),
                session.heartbeat.clone(),
                session.channel_status(),
            )));
            tasks.heartbeat = Some(session.heartbeat.spawn(channel, session.channel_status()));
            tasks.sharing = Some(session.spawn_sharing_watcher());
        }

        info!(
            room = %session.config.room_id,
            participant = %session.config.participant_id,
            "joined call"
        );
        Ok(session)
    }

    /// Announces screen-share changes, including the automatic restore when
    /// the capture source ends.
    fn spawn_sharing_watcher(&self) -> JoinHandle<()> {
        let mut sharing = self.media.sharing();
        let sender = self.sender.clone();
        let room_id = self.config.room_id.clone();
        tokio::spawn(async move {
            let mut announced = *sharing.borrow_and_update();
            while sharing.changed().await.is_ok() {
                let state = *sharing.borrow_and_update();
                if state == announced {
                    continue;
                }
                announced = state;
                if let Err(e) = sender.send(ClientMessage::toggle(StateKind::ScreenShare, room_id.clone(), state)) {
                    debug!(error = %e, state, "screen share toggle not sent");
                }
            }
        })
    }

    pub fn participant_id(&self) -> &str {
        &self.config.participant_id
    }

    pub fn room_id(&self) -> &str {
        &self.config.room_id
    }

    pub fn media(&self) -> &Arc<MediaCaptureManager> {
        &self.media
    }

    pub fn orchestrator(&self) -> &Arc<ConnectionOrchestrator> {
        &self.orchestrator
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.orchestrator.subscribe()
    }

    /// State of the WebSocket channel; `None` over a caller-supplied channel.
    pub fn channel_status(&self) -> Option<watch::Receiver<ConnectionStatus>> {
        self.client.as_ref().map(|client| client.monitor().subscribe())
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    /// Mutes or unmutes locally, then tells the room. The local change holds
    /// even if the announcement is dropped.
    pub fn set_audio(&self, enabled: bool) -> Result<()> {
        self.media.set_audio_enabled(enabled);
        self.announce(StateKind::Audio, enabled)
    }

    pub fn set_video(&self, enabled: bool) -> Result<()> {
        self.media.set_video_enabled(enabled);
        self.announce(StateKind::Video, enabled)
    }

    /// Swaps the outgoing video of every link to a display capture.
    pub async fn share_screen(&self) -> Result<LocalTrack> {
        self.media.acquire_screen_capture(&QualityProfile::screen()).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.media.restore_camera().await
    }

    fn announce(&self, kind: StateKind, state: bool) -> Result<()> {
        self.sender
            .send(ClientMessage::toggle(kind, self.config.room_id.clone(), state))
    }

    /// Tears the session down: local media, peer links, the inbound pump,
    /// timers, then the signaling channel. Safe to call more than once.
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(room = %self.config.room_id, participant = %self.config.participant_id, "leaving call");

        self.media.stop_all().await;

        self.orchestrator.close_all().await;
        let pump = self.tasks.lock().pump.take();
        if let Some(pump) = pump {
            pump.abort();
        }

        self.orchestrator.cancel_timers();
        {
            let mut tasks = self.tasks.lock();
            for task in [tasks.heartbeat.take(), tasks.sharing.take()].into_iter().flatten() {
                task.abort();
            }
        }

        if let Err(e) = self.sender.send(ClientMessage::LeaveRoom) {
            debug!(error = %e, "leave-room not sent");
        }
        if let Some(client) = &self.client {
            client.close().await;
        }
    }
}

async fn pump(
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    orchestrator: Arc<ConnectionOrchestrator>,
    heartbeat: Arc<HeartbeatMonitor>,
    status: Option<watch::Receiver<ConnectionStatus>>,
) {
    let mut seen = status.as_ref().map(|status| status.borrow().sessions);
    while let Some(message) = inbound.recv().await {
        // A new channel session replays the join; its roster supersedes
        // whatever the previous session taught us.
        if let Some(status) = &status {
            let sessions = status.borrow().sessions;
            if seen != Some(sessions) {
                seen = Some(sessions);
                orchestrator.expect_roster();
            }
        }
        match message {
            ServerMessage::Pong => heartbeat.record_pong(),
            other => orchestrator.handle_signal(other).await,
        }
    }
    debug!("signaling inbound stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::Liveness;
    use crate::media::{SyntheticDevices, TrackKind};
    use crate::peer::LinkState;
    use crate::room::{RoomRegistry, SignalingRelay, Transport};
    use crate::testing::{FakePeerConnectionFactory, RecordingSignal};
    use crate::Error;
    use std::time::Duration;

    struct Member {
        session: Arc<CallSession>,
        signal: Arc<RecordingSignal>,
        factory: Arc<FakePeerConnectionFactory>,
        devices: Arc<SyntheticDevices>,
        _transport: Transport,
    }

    fn config(id: &str) -> ClientConfig {
        ClientConfig {
            room_id: "R1".into(),
            participant_id: id.into(),
            display_name: id.to_uppercase(),
            ..ClientConfig::default()
        }
    }

    async fn member(relay: &Arc<SignalingRelay>, id: &str) -> Member {
        let (transport, inbound) = Transport::new();
        let signal = RecordingSignal::forwarding(relay.clone(), transport.handle());
        let factory = FakePeerConnectionFactory::new();
        let devices = Arc::new(SyntheticDevices::new());
        let session = CallSession::join_over(config(id), devices.clone(), factory.clone(), signal.clone(), inbound)
            .await
            .unwrap();
        Member {
            session,
            signal,
            factory,
            devices,
            _transport: transport,
        }
    }

    fn relay() -> Arc<SignalingRelay> {
        Arc::new(SignalingRelay::new(Arc::new(RoomRegistry::new())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_sessions_connect() {
        let relay = relay();
        let a = member(&relay, "a").await;
        let b = member(&relay, "b").await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(a.session.orchestrator().link_state("b").await, Some(LinkState::Connected));
        assert_eq!(b.session.orchestrator().link_state("a").await, Some(LinkState::Connected));
        assert_eq!(relay.registry().roster("R1").len(), 2);

        let pc = a.factory.latest("b").unwrap();
        assert!(pc.sending(TrackKind::Audio).is_some());
        assert!(pc.sending(TrackKind::Video).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_and_screen_share_reach_remote() {
        let relay = relay();
        let a = member(&relay, "a").await;
        let b = member(&relay, "b").await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let offers_before: u32 = a.factory.connections_to("b").iter().map(|pc| pc.offers_created()).sum();

        a.session.set_audio(false).unwrap();
        let screen = a.session.share_screen().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let view = b.session.orchestrator().remote("a").unwrap();
        assert!(!view.audio_on);
        assert!(view.screen_sharing);
        assert_eq!(
            a.factory.latest("b").unwrap().sending(TrackKind::Video).as_deref(),
            Some(screen.id())
        );
        assert_eq!(a.session.orchestrator().link_state("b").await, Some(LinkState::Connected));
        let offers_after: u32 = a.factory.connections_to("b").iter().map(|pc| pc.offers_created()).sum();
        assert_eq!(offers_before, offers_after);

        // The capture source ending restores the camera and is announced.
        assert!(a.devices.end_screen_capture());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!b.session.orchestrator().remote("a").unwrap().screen_sharing);
        assert!(!a.session.media().is_sharing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_tears_down_and_notifies_room() {
        let relay = relay();
        let a = member(&relay, "a").await;
        let b = member(&relay, "b").await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let pc = a.factory.latest("b").unwrap();

        a.session.leave().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(a.session.has_left());
        assert!(pc.is_closed());
        assert!(a.session.media().microphone().is_none());
        assert_eq!(a.signal.sent().last(), Some(&ClientMessage::LeaveRoom));
        assert_eq!(relay.registry().roster("R1"), vec!["b".to_string()]);
        assert_eq!(b.session.orchestrator().link_state("a").await, None);
        assert!(a.session.orchestrator().remotes().is_empty());
        assert!(a.session.orchestrator().link_states().await.is_empty());

        // Idempotent.
        a.session.leave().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_is_answered_by_relay() {
        let relay = relay();
        let a = member(&relay, "a").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(a.signal.sent().contains(&ClientMessage::Ping));
        assert_eq!(a.session.heartbeat().liveness(), Liveness::Alive);
        assert!(a.session.heartbeat().last_rtt().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newcomer_during_leave_gets_no_link() {
        let relay = relay();
        let a = member(&relay, "a").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _b = member(&relay, "b").await;

        // b's arrival may still be in flight when a leaves.
        a.session.leave().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(a.factory.connections_to("b").is_empty());
        assert!(a.session.orchestrator().remotes().is_empty());
    }

    #[tokio::test]
    async fn test_media_failure_sends_nothing() {
        let relay = relay();
        let (transport, inbound) = Transport::new();
        let signal = RecordingSignal::forwarding(relay.clone(), transport.handle());
        let devices = Arc::new(SyntheticDevices::new());
        devices.deny_permission(true);

        let err = CallSession::join_over(
            config("a"),
            devices,
            FakePeerConnectionFactory::new(),
            signal.clone(),
            inbound,
        )
        .await
        .err()
        .unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::MediaAcquisition(_)));
        assert!(signal.sent().is_empty());
        assert!(!relay.registry().contains_room("R1"));
    }

    #[tokio::test]
    async fn test_unknown_profile_is_rejected() {
        let mut config = config("a");
        config.quality_profile = "ultra".into();
        let (_transport, inbound) = Transport::new();
        let err = CallSession::join_over(
            config,
            Arc::new(SyntheticDevices::new()),
            FakePeerConnectionFactory::new(),
            RecordingSignal::new(),
            inbound,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
