mod config;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pcp_core::{session::source::parse_tracker, PeerCast, RelayServer};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "pcp-node", version, about = "PeerCast protocol relay node")]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "PCP_CONFIG")]
    config: Option<String>,

    /// Listen address, overriding the configured host and port
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Relay a channel from `pcp://host:port/<channel id>`; may be repeated
    #[arg(short, long = "relay", value_name = "PCP_URI")]
    relay: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    // 2. Logging
    logging::init_logging(&config.logging)?;
    info!("pcp-node {} starting", env!("CARGO_PKG_VERSION"));

    // 3. Node and listener
    let listen = match cli.listen {
        Some(addr) => addr,
        None => config
            .listen_address()
            .context("invalid server.listen_host")?,
    };
    let peercast = PeerCast::new(config.relay_settings());
    info!(session_id = %peercast.session_id(), "node identity");
    let server = RelayServer::bind(peercast.clone(), listen)
        .await
        .with_context(|| format!("failed to listen on {listen}"))?;
    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    // 4. Channels relayed from the start
    for uri in cli.relay.iter().chain(config.channels.iter()) {
        match parse_tracker(uri) {
            Some((tracker, Some(channel_id))) => {
                info!(%channel_id, tracker = %tracker, "relaying channel");
                peercast.request_channel(channel_id, Some(tracker), false);
            }
            _ => warn!("ignoring {uri}: expected pcp://host:port/<channel id>"),
        }
    }

    // 5. Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();
    peercast.shutdown();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("listener failed: {err}"),
        Err(err) => error!("listener task failed: {err}"),
    }
    info!("pcp-node stopped");
    Ok(())
}
