use super::{ClientMessage, ServerMessage, SignalChannel, SignalSender};
use crate::connection::{ConnectionMonitor, ConnectionState, ReconnectPolicy};
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket signaling channel with bounded automatic reconnect.
///
/// After a reconnect the last `join-room` sent through [`SignalingClient::send_join`]
/// is replayed so the relay re-registers the session.
pub struct SignalingClient {
    url: String,
    policy: ReconnectPolicy,
    monitor: ConnectionMonitor,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    rejoin: Mutex<Option<ClientMessage>>,
    reconnect_now: Notify,
    closed: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub async fn connect(
        url: &str,
        policy: ReconnectPolicy,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ServerMessage>)> {
        let monitor = ConnectionMonitor::new();
        monitor.update_state(ConnectionState::Connecting);
        let stream = dial(url, &policy, &monitor).await?;

        let (closed, _) = watch::channel(false);
        let client = Arc::new(Self {
            url: url.to_string(),
            policy,
            monitor,
            outgoing: Mutex::new(None),
            rejoin: Mutex::new(None),
            reconnect_now: Notify::new(),
            closed,
            supervisor: Mutex::new(None),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        // Install the first session's sender before returning so callers can
        // send immediately.
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *client.outgoing.lock() = Some(out_tx);
        client.monitor.update_state(ConnectionState::Connected);

        let handle = tokio::spawn(Arc::clone(&client).supervise(stream, out_rx, inbound_tx));
        *client.supervisor.lock() = Some(handle);

        info!(url = %client.url, "signaling channel connected");
        Ok((client, inbound_rx))
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// Sends `join-room` and remembers it for replay after a reconnect.
    pub fn send_join(&self, join: ClientMessage) -> Result<()> {
        *self.rejoin.lock() = Some(join.clone());
        self.send(join)
    }

    /// Closes the channel and stops reconnecting.
    pub async fn close(&self) {
        self.rejoin.lock().take();
        self.closed.send_replace(true);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!(url = %self.url, "signaling channel did not close in time");
            }
        }
        self.outgoing.lock().take();
        self.monitor.update_state(ConnectionState::Disconnected);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn supervise(
        self: Arc<Self>,
        mut stream: WsStream,
        mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
        inbound: mpsc::UnboundedSender<ServerMessage>,
    ) {
        loop {
            let reason = self.run_session(stream, out_rx, &inbound).await;
            self.outgoing.lock().take();

            if self.is_closed() || inbound.is_closed() {
                debug!(url = %self.url, "signaling supervisor stopping");
                return;
            }

            warn!(url = %self.url, %reason, "signaling channel lost, reconnecting");
            self.monitor.update_state(ConnectionState::Reconnecting);

            let mut closed = self.closed.subscribe();
            let redialed = tokio::select! {
                result = dial(&self.url, &self.policy, &self.monitor) => result,
                _ = closed.wait_for(|closed| *closed) => return,
            };

            match redialed {
                Ok(next) => {
                    stream = next;
                    let (tx, rx) = mpsc::unbounded_channel();
                    if let Some(join) = self.rejoin.lock().clone() {
                        let _ = tx.send(join);
                    }
                    *self.outgoing.lock() = Some(tx);
                    out_rx = rx;
                    self.monitor.update_state(ConnectionState::Connected);
                    info!(url = %self.url, "signaling channel re-established");
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "signaling channel failed permanently");
                    self.monitor.set_failed(e.to_string());
                    return;
                }
            }
        }
    }

    /// Pumps one WebSocket connection until it ends; returns why it ended.
    async fn run_session(
        &self,
        stream: WsStream,
        mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
        inbound: &mpsc::UnboundedSender<ServerMessage>,
    ) -> String {
        let (mut write, mut read) = stream.split();
        let mut closed = self.closed.subscribe();
        // Registered for this session only; requests made while redialing
        // have no waiter and are dropped.
        let reconnect = self.reconnect_now.notified();
        tokio::pin!(reconnect);

        loop {
            tokio::select! {
                Some(msg) = out_rx.recv() => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(kind = msg.kind(), error = %e, "failed to encode signaling message");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        return format!("write failed: {}", e);
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                if inbound.send(msg).is_err() {
                                    return "receiver dropped".to_string();
                                }
                            }
                            Err(e) => debug!(error = %e, "ignoring malformed relay frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return "closed by relay".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("read failed: {}", e),
                },
                _ = &mut reconnect => {
                    let _ = write.send(Message::Close(None)).await;
                    return "reconnect requested".to_string();
                }
                _ = async { closed.wait_for(|closed| *closed).await.map(|_| ()) } => {
                    let _ = write.send(Message::Close(None)).await;
                    return "closed locally".to_string();
                }
            }
        }
    }
}

impl SignalSender for SignalingClient {
    fn send(&self, message: ClientMessage) -> Result<()> {
        match self.outgoing.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| Error::ChannelDown),
            None => {
                debug!(kind = message.kind(), "dropping signaling message while channel is down");
                Err(Error::ChannelDown)
            }
        }
    }
}

impl SignalChannel for SignalingClient {
    fn request_reconnect(&self) {
        self.reconnect_now.notify_waiters();
    }
}

/// Connects with the policy's backoff; gives up after its attempt budget.
async fn dial(url: &str, policy: &ReconnectPolicy, monitor: &ConnectionMonitor) -> Result<WsStream> {
    let mut attempt = 0;
    loop {
        match connect_async(url).await {
            Ok((stream, _)) => return Ok(stream),
            Err(e) => {
                monitor.record_attempt_failure(e.to_string());
                attempt += 1;
                if !policy.should_retry(attempt) {
                    return Err(Error::ReconnectExhausted(attempt));
                }
                let delay = policy.backoff(attempt - 1);
                debug!(url, attempt, ?delay, error = %e, "signaling connect failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
