//! Signaling channel keepalive.
//!
//! The monitor only judges the channel to the relay. It never touches peer
//! links or media; a stale channel just triggers a channel reconnect.

use crate::connection::ConnectionStatus;
use crate::signaling::{ClientMessage, SignalChannel};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Last ping was acknowledged.
    Alive,
    /// A ping is outstanding and still within the timeout.
    Waiting,
    /// A ping went unanswered past the timeout.
    Stale,
    /// The ping could not be sent at all.
    ChannelDown,
}

struct PingState {
    outstanding_since: Option<Instant>,
    missed: u32,
    last_rtt: Option<Duration>,
}

pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    state: Mutex<PingState>,
    liveness: watch::Sender<Liveness>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Arc<Self> {
        let (liveness, _) = watch::channel(Liveness::Alive);
        Arc::new(Self {
            interval,
            timeout,
            state: Mutex::new(PingState {
                outstanding_since: None,
                missed: 0,
                last_rtt: None,
            }),
            liveness,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Liveness> {
        self.liveness.subscribe()
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    pub fn missed(&self) -> u32 {
        self.state.lock().missed
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.state.lock().last_rtt
    }

    /// Called for every `pong` received from the relay.
    pub fn record_pong(&self) {
        let mut state = self.state.lock();
        if let Some(sent) = state.outstanding_since.take() {
            state.last_rtt = Some(sent.elapsed());
        }
        state.missed = 0;
        drop(state);
        self.liveness.send_replace(Liveness::Alive);
    }

    /// Forgets any outstanding ping; the channel it was sent on is gone.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.outstanding_since = None;
            state.missed = 0;
        }
        self.liveness.send_replace(Liveness::Alive);
    }

    /// One heartbeat step: judge the outstanding ping, or send a new one if
    /// none is outstanding.
    pub fn tick(&self, channel: &dyn SignalChannel) {
        let overdue = {
            let mut state = self.state.lock();
            match state.outstanding_since {
                Some(sent) if sent.elapsed() >= self.timeout => {
                    state.outstanding_since = None;
                    state.missed += 1;
                    Some(state.missed)
                }
                _ => None,
            }
        };

        if let Some(missed) = overdue {
            warn!(missed, timeout = ?self.timeout, "signaling heartbeat overdue, reconnecting channel");
            self.liveness.send_replace(Liveness::Stale);
            channel.request_reconnect();
            return;
        }

        if self.state.lock().outstanding_since.is_some() {
            return;
        }

        match channel.send(ClientMessage::Ping) {
            Ok(()) => {
                self.state.lock().outstanding_since = Some(Instant::now());
                if self.liveness() != Liveness::Stale {
                    self.liveness.send_replace(Liveness::Waiting);
                }
            }
            Err(e) => {
                debug!(error = %e, "heartbeat ping not sent");
                self.liveness.send_replace(Liveness::ChannelDown);
            }
        }
    }

    /// Runs the heartbeat until the returned task is aborted.
    ///
    /// With a channel status, every new channel session starts from a clean
    /// slate instead of judging a ping sent before the reconnect.
    pub fn spawn(
        self: &Arc<Self>,
        channel: Arc<dyn SignalChannel>,
        status: Option<watch::Receiver<ConnectionStatus>>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut seen = status.as_ref().map(|status| status.borrow().sessions);
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(status) = &status {
                    let sessions = status.borrow().sessions;
                    if seen != Some(sessions) {
                        debug!(sessions, "signaling channel reconnected, heartbeat reset");
                        seen = Some(sessions);
                        monitor.reset();
                    }
                }
                monitor.tick(channel.as_ref());
            }
        })
    }
}
