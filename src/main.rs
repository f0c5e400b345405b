//! Headless call participant.
//!
//! Joins a room through the relay with synthetic media and the webrtc-rs
//! peer connection, then takes simple commands on stdin:
//! `mute`, `unmute`, `video on`, `video off`, `share`, `unshare`, `status`, `leave`.

use anyhow::{Context, Result};
use clap::Parser;
use mesh_call::config::ClientConfig;
use mesh_call::media::{MediaDevices, SyntheticDevices};
use mesh_call::peer::rtc::WebRtcPeerConnectionFactory;
use mesh_call::{CallEvent, CallSession};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mesh-call", version, about = "Join a full-mesh call as a headless participant")]
struct Args {
    /// JSON client configuration; flags override its values.
    #[arg(long, short = 'c', env = "MESH_CALL_CONFIG")]
    config: Option<PathBuf>,

    /// Relay WebSocket URL.
    #[arg(long, env = "MESH_CALL_URL")]
    url: Option<String>,

    #[arg(long, short = 'r', env = "MESH_CALL_ROOM")]
    room: Option<String>,

    #[arg(long, env = "MESH_CALL_PARTICIPANT")]
    participant_id: Option<String>,

    #[arg(long, short = 'n', env = "MESH_CALL_NAME")]
    name: Option<String>,

    /// low, standard, high or screen.
    #[arg(long, env = "MESH_CALL_PROFILE")]
    profile: Option<String>,

    /// STUN/TURN server URL; repeatable.
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Give up on a peer link after this many consecutive ICE restarts.
    #[arg(long)]
    max_ice_restarts: Option<u32>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "MESH_CALL_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(url) = &self.url {
            config.signaling_url = url.clone();
        }
        if let Some(room) = &self.room {
            config.room_id = room.clone();
        }
        if let Some(id) = &self.participant_id {
            config.participant_id = id.clone();
        }
        if let Some(name) = &self.name {
            config.display_name = name.clone();
        }
        if let Some(profile) = &self.profile {
            config.quality_profile = profile.clone();
        }
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers.clone();
        }
        if self.max_ice_restarts.is_some() {
            config.timing.max_ice_restarts = self.max_ice_restarts;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn media_devices() -> Arc<dyn MediaDevices> {
    #[cfg(feature = "native-audio")]
    {
        Arc::new(mesh_call::media::NativeAudioDevices::new(SyntheticDevices::new()))
    }
    #[cfg(not(feature = "native-audio"))]
    {
        Arc::new(SyntheticDevices::new())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);
    let config = args.client_config()?;

    let factory = Arc::new(WebRtcPeerConnectionFactory::new(config.ice_servers.clone())?);
    let session = CallSession::join(config, media_devices(), factory)
        .await
        .context("joining call")?;

    tokio::spawn(log_events(session.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&session, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => {
                    // stdin closed; stay in the call until interrupted.
                    if tokio::signal::ctrl_c().await.is_err() {
                        warn!("cannot listen for ctrl-c");
                    }
                    break;
                }
                Err(e) => {
                    error!(error = %e, "reading stdin");
                    break;
                }
            }
        }
    }

    session.leave().await;
    Ok(())
}

/// Returns false once the user asked to leave.
async fn run_command(session: &CallSession, command: &str) -> bool {
    let result = match command {
        "" => Ok(()),
        "mute" => session.set_audio(false),
        "unmute" => session.set_audio(true),
        "video off" => session.set_video(false),
        "video on" => session.set_video(true),
        "share" => session.share_screen().await.map(|track| info!(track = track.id(), "sharing screen")),
        "unshare" => session.stop_screen_share().await,
        "status" => {
            for (remote, state) in session.orchestrator().link_states().await {
                info!(%remote, %state, "peer link");
            }
            Ok(())
        }
        "leave" | "quit" => return false,
        other => {
            warn!(command = other, "unknown command");
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(command, error = %e, "command failed");
    }
    true
}

async fn log_events(session: Arc<CallSession>) {
    let mut events = session.events();
    loop {
        match events.recv().await {
            Ok(CallEvent::RemoteJoined {
                participant_id,
                display_name,
            }) => info!(remote = %participant_id, name = %display_name, "participant in room"),
            Ok(CallEvent::RemoteLeft { participant_id }) => info!(remote = %participant_id, "participant gone"),
            Ok(CallEvent::LinkStateChanged { participant_id, state }) => {
                info!(remote = %participant_id, %state, "link state")
            }
            Ok(CallEvent::RemoteMediaChanged {
                participant_id,
                kind,
                state,
            }) => info!(remote = %participant_id, ?kind, state, "remote media"),
            Ok(CallEvent::RemoteTrack { participant_id, kind }) => {
                info!(remote = %participant_id, %kind, "receiving remote track")
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
