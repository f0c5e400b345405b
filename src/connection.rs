//! Signaling channel state and reconnect policy.

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect budget exhausted. Terminal until the user reloads or leaves.
    Failed,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed connect attempts in the current outage.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Bumped each time the channel (re)enters `Connected`.
    pub sessions: u64,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_error: None,
            sessions: 0,
        }
    }
}

/// Publishes the signaling channel's status to any number of observers.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    receiver: watch::Receiver<ConnectionStatus>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConnectionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            if state == ConnectionState::Connected {
                if status.state != ConnectionState::Connected {
                    status.sessions += 1;
                }
                status.attempts = 0;
                status.last_error = None;
            }
            status.state = state;
        });
    }

    pub fn record_attempt_failure(&self, error: String) {
        self.status.send_modify(|status| {
            status.attempts += 1;
            status.last_error = Some(error);
        });
    }

    pub fn set_failed(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
            status.state = ConnectionState::Failed;
        });
    }

    pub fn current(&self) -> ConnectionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}

/// Bounded exponential backoff for reconnecting the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Adds up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = (self.initial_backoff_ms as f64) * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);
        let jittered = if self.jitter && capped > 0.0 {
            capped + rand::thread_rng().gen_range(0.0..=capped * 0.25)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("reconnect.maxAttempts must be at least 1".into()));
        }
        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfig("reconnect.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}
