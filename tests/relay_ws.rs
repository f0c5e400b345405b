//! The relay over real WebSockets on an ephemeral port.

use futures_util::{SinkExt, StreamExt};
use mesh_call::config::{ClientConfig, TimingConfig};
use mesh_call::connection::{ConnectionState, ReconnectPolicy};
use mesh_call::media::SyntheticDevices;
use mesh_call::peer::LinkState;
use mesh_call::room::{RelayServer, RoomRegistry, SignalingRelay};
use mesh_call::signaling::{
    ClientMessage, ServerMessage, SessionDescription, SignalChannel, SignalSender, SignalingClient,
};
use mesh_call::testing::FakePeerConnectionFactory;
use mesh_call::{CallSession, Error};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestRelay {
    addr: SocketAddr,
    relay: Arc<SignalingRelay>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    async fn spawn() -> Self {
        let relay = Arc::new(SignalingRelay::new(Arc::new(RoomRegistry::new())));
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), relay.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(server.run(async {
            let _ = rx.await;
        }));
        Self {
            addr,
            relay,
            shutdown: Some(tx),
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn connect(&self) -> Ws {
        let (ws, _) = connect_async(self.url()).await.unwrap();
        ws
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn send(ws: &mut Ws, message: &ClientMessage) {
    ws.send(Message::Text(serde_json::to_string(message).unwrap()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "unexpected frame: {:?}", next);
}

fn join(id: &str) -> ClientMessage {
    ClientMessage::JoinRoom {
        room_id: "R1".into(),
        participant_id: id.into(),
        display_name: id.to_uppercase(),
    }
}

async fn wait_for_roster(relay: &SignalingRelay, expected: &[&str]) {
    for _ in 0..100 {
        if relay.registry().roster("R1") == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("roster never became {:?}: {:?}", expected, relay.registry().roster("R1"));
}

#[tokio::test]
async fn test_join_route_and_disconnect() {
    let relay = TestRelay::spawn().await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;

    send(&mut a, &join("a")).await;
    assert_eq!(recv(&mut a).await, ServerMessage::RoomParticipants { participants: vec![] });

    send(&mut b, &join("b")).await;
    match recv(&mut b).await {
        ServerMessage::RoomParticipants { participants } => {
            assert_eq!(participants.len(), 1);
            assert_eq!(participants[0].participant_id, "a");
        }
        other => panic!("expected roster, got {:?}", other),
    }
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::UserJoined {
            participant_id: "b".into(),
            display_name: "B".into()
        }
    );

    send(
        &mut a,
        &ClientMessage::Offer {
            target_participant_id: "b".into(),
            sdp: SessionDescription::offer("v=0"),
            room_id: "R1".into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut b).await,
        ServerMessage::Offer {
            sdp: SessionDescription::offer("v=0"),
            sender_participant_id: "a".into()
        }
    );

    // Unknown target: dropped, sender hears nothing.
    send(
        &mut a,
        &ClientMessage::Answer {
            target_participant_id: "ghost".into(),
            sdp: SessionDescription::answer("v=0"),
            room_id: "R1".into(),
        },
    )
    .await;
    assert_silent(&mut a).await;

    b.close(None).await.unwrap();
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::UserLeft {
            participant_id: "b".into(),
            display_name: "B".into()
        }
    );
    wait_for_roster(&relay.relay, &["a"]).await;
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let relay = TestRelay::spawn().await;
    let mut a = relay.connect().await;

    a.send(Message::Text("not json".into())).await.unwrap();
    a.send(Message::Text(r#"{"type":"teleport"}"#.into())).await.unwrap();
    send(&mut a, &ClientMessage::Ping).await;
    assert_eq!(recv(&mut a).await, ServerMessage::Pong);
}

#[tokio::test]
async fn test_last_leave_deletes_room() {
    let relay = TestRelay::spawn().await;
    let mut a = relay.connect().await;
    send(&mut a, &join("a")).await;
    recv(&mut a).await;
    assert!(relay.relay.registry().contains_room("R1"));

    send(&mut a, &ClientMessage::LeaveRoom).await;
    wait_for_roster(&relay.relay, &[]).await;
    assert!(!relay.relay.registry().contains_room("R1"));
}

#[tokio::test]
async fn test_signaling_client_gives_up_after_budget() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let policy = ReconnectPolicy {
        max_attempts: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        multiplier: 2.0,
        jitter: false,
    };
    let err = SignalingClient::connect(&format!("ws://{}", addr), policy)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::ReconnectExhausted(2)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_reconnect_replays_join() {
    let relay = TestRelay::spawn().await;
    let (client, mut inbound) = SignalingClient::connect(&relay.url(), ReconnectPolicy::default())
        .await
        .unwrap();
    client.send_join(join("a")).unwrap();
    let first = tokio::time::timeout(RECV_TIMEOUT, inbound.recv()).await.unwrap();
    assert!(matches!(first, Some(ServerMessage::RoomParticipants { .. })));

    client.request_reconnect();
    let replayed = tokio::time::timeout(RECV_TIMEOUT, inbound.recv()).await.unwrap();
    assert!(matches!(replayed, Some(ServerMessage::RoomParticipants { .. })));
    assert_eq!(client.monitor().current().state, ConnectionState::Connected);
    wait_for_roster(&relay.relay, &["a"]).await;

    client.close().await;
    assert!(matches!(client.send(ClientMessage::Ping), Err(Error::ChannelDown)));
    assert_eq!(client.monitor().current().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_repeated_reconnect_requests_redial_once() {
    let relay = TestRelay::spawn().await;
    let (client, mut inbound) = SignalingClient::connect(&relay.url(), ReconnectPolicy::default())
        .await
        .unwrap();
    client.send_join(join("a")).unwrap();
    let first = tokio::time::timeout(RECV_TIMEOUT, inbound.recv()).await.unwrap();
    assert!(matches!(first, Some(ServerMessage::RoomParticipants { .. })));

    client.request_reconnect();
    client.request_reconnect();
    let replayed = tokio::time::timeout(RECV_TIMEOUT, inbound.recv()).await.unwrap();
    assert!(matches!(replayed, Some(ServerMessage::RoomParticipants { .. })));

    // No second redial follows the first.
    let extra = tokio::time::timeout(Duration::from_millis(300), inbound.recv()).await;
    assert!(extra.is_err(), "unexpected message: {:?}", extra);
    let status = client.monitor().current();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.sessions, 2);

    client.close().await;
}

#[tokio::test]
async fn test_lost_relay_exhausts_reconnect_budget() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (hang_up, hung_up) = oneshot::channel::<()>();
    // Accepts one session, then goes away for good.
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let _ = hung_up.await;
        drop(ws);
        drop(listener);
    });

    let policy = ReconnectPolicy {
        max_attempts: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        multiplier: 2.0,
        jitter: false,
    };
    let (client, _inbound) = SignalingClient::connect(&format!("ws://{}", addr), policy)
        .await
        .unwrap();
    let mut status = client.monitor().subscribe();
    hang_up.send(()).unwrap();
    server.await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|status| status.state == ConnectionState::Failed),
    )
    .await
    .expect("channel never failed")
    .unwrap();

    let current = client.monitor().current();
    assert_eq!(current.state, ConnectionState::Failed);
    assert!(current.last_error.unwrap_or_default().contains("gave up after 2"));
    assert!(matches!(client.send(ClientMessage::Ping), Err(Error::ChannelDown)));
}

#[tokio::test]
async fn test_call_sessions_connect_through_relay() {
    let relay = TestRelay::spawn().await;
    let timing = TimingConfig {
        offer_settle_delay_ms: 50,
        ..TimingConfig::default()
    };
    let config = |id: &str| ClientConfig {
        signaling_url: relay.url(),
        room_id: "R1".into(),
        participant_id: id.into(),
        display_name: id.to_uppercase(),
        timing: timing.clone(),
        ..ClientConfig::default()
    };

    let a = CallSession::join(config("a"), Arc::new(SyntheticDevices::new()), FakePeerConnectionFactory::new())
        .await
        .unwrap();
    let b = CallSession::join(config("b"), Arc::new(SyntheticDevices::new()), FakePeerConnectionFactory::new())
        .await
        .unwrap();
    assert_eq!(
        a.channel_status().map(|status| status.borrow().state),
        Some(ConnectionState::Connected)
    );

    let mut link = None;
    for _ in 0..100 {
        link = a.orchestrator().link_state("b").await;
        if link == Some(LinkState::Connected) && b.orchestrator().link_state("a").await == Some(LinkState::Connected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(link, Some(LinkState::Connected));

    a.leave().await;
    wait_for_roster(&relay.relay, &["b"]).await;
    for _ in 0..100 {
        if b.orchestrator().link_state("a").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(b.orchestrator().link_state("a").await, None);
    b.leave().await;
}
