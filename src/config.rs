//! Configuration for the relay and the call client.
//!
//! Every value has a named default so the binaries run without a config file;
//! a JSON file and command-line flags override them.

use crate::connection::ReconnectPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Delay before offering to a newly discovered participant, so it can finish
/// acquiring media and registering its transport.
pub const OFFER_SETTLE_DELAY_MS: u64 = 1000;
/// How long a link may sit in `disconnected` before an ICE restart.
pub const DISCONNECT_GRACE_MS: u64 = 3000;
pub const HEALTH_SWEEP_INTERVAL_MS: u64 = 5000;
pub const HEARTBEAT_INTERVAL_MS: u64 = 25_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }
}

/// Named timing heuristics of the peer-link lifecycle and the heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingConfig {
    pub offer_settle_delay_ms: u64,
    pub disconnect_grace_ms: u64,
    pub health_sweep_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Consecutive ICE restarts allowed without reaching `connected`.
    /// `None` leaves restarts unbounded.
    pub max_ice_restarts: Option<u32>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            offer_settle_delay_ms: OFFER_SETTLE_DELAY_MS,
            disconnect_grace_ms: DISCONNECT_GRACE_MS,
            health_sweep_interval_ms: HEALTH_SWEEP_INTERVAL_MS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            max_ice_restarts: None,
        }
    }
}

impl TimingConfig {
    pub fn offer_settle_delay(&self) -> Duration {
        Duration::from_millis(self.offer_settle_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn health_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.health_sweep_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("healthSweepIntervalMs", self.health_sweep_interval_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("heartbeatTimeoutMs", self.heartbeat_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub signaling_url: String,
    pub room_id: String,
    pub participant_id: String,
    pub display_name: String,
    pub ice_servers: Vec<String>,
    pub quality_profile: String,
    pub timing: TimingConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let participant_id = format!("user-{}", rand::random::<u32>());
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            room_id: "lobby".to_string(),
            display_name: participant_id.clone(),
            participant_id,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            quality_profile: "standard".to_string(),
            timing: TimingConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.signaling_url.is_empty() {
            return Err(Error::InvalidConfig("signalingUrl is empty".into()));
        }
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signalingUrl must be ws:// or wss://, got {}",
                self.signaling_url
            )));
        }
        if self.room_id.is_empty() || self.participant_id.is_empty() {
            return Err(Error::InvalidConfig(
                "roomId and participantId are required".into(),
            ));
        }
        self.timing.validate()?;
        self.reconnect.validate()
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
