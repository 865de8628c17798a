//! relay-tap
//!
//! Starts one capturing relay instance and, optionally, the subscriber
//! endpoint, then runs until SIGINT/SIGTERM.
//!
//! ```text
//!     client ──▶ :port ──▶ relay ──▶ localhost:target
//!                            │
//!                            └──▶ broadcaster ──▶ ws://:ws-port subscribers
//! ```

use std::path::PathBuf;

use clap::Parser;

use relay_tap::config::{load_config, ProxyConfig};
use relay_tap::lifecycle::signals::shutdown_signal;
use relay_tap::observability::logging;
use relay_tap::ProxyRegistry;

#[derive(Debug, Parser)]
#[command(name = "relay-tap", version, about = "Capturing reverse proxy")]
struct Cli {
    /// Instance identifier.
    #[arg(long, default_value = "default")]
    id: String,

    /// Port the relay listens on.
    #[arg(long)]
    port: u16,

    /// Backend port on localhost.
    #[arg(long)]
    target: u16,

    /// Subscriber WebSocket port; omitted means no endpoint.
    #[arg(long)]
    ws_port: Option<u16>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "relay-tap starting");

    let registry = ProxyRegistry::new(config);

    let listen_port = registry.start(&cli.id, cli.port, cli.target).await?;
    tracing::info!(
        instance_id = %cli.id,
        listen_port,
        target_port = cli.target,
        "Relay ready"
    );

    if let Some(ws_port) = cli.ws_port {
        let port = registry.start_channel(ws_port).await?;
        tracing::info!(port, "Subscribers can connect");
    }

    shutdown_signal().await;
    registry.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
