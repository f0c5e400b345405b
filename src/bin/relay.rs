//! Signaling relay server.

use anyhow::{Context, Result};
use clap::Parser;
use mesh_call::config::RelayConfig;
use mesh_call::room::{RelayServer, RoomRegistry, SignalingRelay};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mesh-relay", version, about = "Room registry and signaling relay for mesh calls")]
struct Args {
    /// JSON relay configuration; flags override its values.
    #[arg(long, short = 'c', env = "MESH_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept WebSocket connections on.
    #[arg(long, short = 'b', env = "MESH_RELAY_BIND")]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "MESH_RELAY_JSON_LOGS")]
    json_logs: bool,
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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let relay = Arc::new(SignalingRelay::new(Arc::new(RoomRegistry::new())));
    let server = RelayServer::bind(config.bind_addr, relay)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %server.local_addr()?, version = env!("CARGO_PKG_VERSION"), "mesh relay starting");

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}
