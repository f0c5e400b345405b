//! WebSocket front end of the relay.

use super::registry::Transport;
use super::relay::SignalingRelay;
use crate::signaling::ClientMessage;
use crate::Result;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<SignalingRelay>,
}

impl RelayServer {
    pub async fn bind(addr: SocketAddr, relay: Arc<SignalingRelay>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> &Arc<SignalingRelay> {
        &self.relay
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "relay listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay = Arc::clone(&self.relay);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, relay).await {
                                warn!(%peer, error = %e, "relay connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
                _ = &mut shutdown => {
                    info!(%addr, "relay shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, relay: Arc<SignalingRelay>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let ws = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (transport, mut outbound) = Transport::new();
    let handle = transport.handle();
    debug!(%peer, transport = transport.id(), "connection opened");

    let forward = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to encode relay message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => relay.handle(&handle, msg),
                Err(e) => debug!(%peer, error = %e, "ignoring malformed client frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%peer, error = %e, "websocket read failed");
                break;
            }
        }
    }

    relay.leave(transport.id());
    drop(transport);
    forward.abort();
    debug!(%peer, "connection closed");
    Ok(())
}
