//! # switchboard
//!
//! Node binary: loads settings, starts telemetry and serves one switchboard
//! node until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use switchboard_server::SwitchboardServer;
use switchboard_settings::{BrokerKind, SwitchboardSettings};
use switchboard_telemetry::{init_telemetry, TelemetryConfig};

/// Live connection registry with cross-node fan-out.
#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Switchboard fan-out node")]
struct Cli {
    /// Settings file (defaults to `~/.switchboard/settings.json`).
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Broker backend: `local` or `relay`.
    #[arg(long, value_parser = parse_broker)]
    broker: Option<BrokerKind>,

    /// Relay hub to dial, e.g. `ws://10.0.0.5:9300/relay`.
    #[arg(long)]
    relay_url: Option<String>,

    /// Serve the relay hub on `/relay`.
    #[arg(long)]
    host_relay: bool,

    /// Stable node id (generated when omitted).
    #[arg(long)]
    node_id: Option<String>,

    /// Disable the Prometheus recorder and `/metrics`.
    #[arg(long)]
    no_metrics: bool,
}

impl Cli {
    fn apply(self, settings: &mut SwitchboardSettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(kind) = self.broker {
            settings.broker.kind = kind;
        }
        if let Some(url) = self.relay_url {
            settings.broker.kind = BrokerKind::Relay;
            settings.broker.relay_url = Some(url);
        }
        if self.host_relay {
            settings.broker.kind = BrokerKind::Relay;
            settings.broker.host_relay = true;
        }
        if let Some(node_id) = self.node_id {
            settings.server.node_id = Some(node_id);
        }
    }
}

fn parse_broker(val: &str) -> Result<BrokerKind, String> {
    BrokerKind::parse(val).ok_or_else(|| format!("unknown broker `{val}`, expected local or relay"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let metrics_enabled = !cli.no_metrics;

    let mut settings = match &cli.config {
        Some(path) => switchboard_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => switchboard_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    let mut telemetry = TelemetryConfig::from_level_str(&settings.logging.level, settings.logging.json);
    telemetry.metrics_enabled = metrics_enabled;
    let guard = init_telemetry(&telemetry).context("Failed to initialize telemetry")?;

    let server = SwitchboardServer::from_settings(&settings, guard.prometheus().cloned())
        .await
        .context("Failed to start switchboard node")?;
    let handle = server.listen().await.context("Failed to bind listener")?;

    tracing::info!(port = handle.port(), "switchboard ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
