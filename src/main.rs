//! `courier`: run the relay hub or a privileged endpoint.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_core::leadership::{Candidate, PRIMARY_TIER};
use courier_hub::HubConfig;
use courier_link::{Endpoint, EndpointConfig, MemoryStore, WsTransport};
use courier_settings::CourierSettings;
use courier_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{info, warn};

/// How long the endpoint waits for its close handshake on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "courier", about = "Request/response relay over WebSockets")]
struct Args {
    /// Settings file (defaults to `~/.courier/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept callers and the endpoint link.
    Hub,
    /// Connect to the hub as the privileged endpoint.
    Endpoint {
        /// Override `link.endpointId`.
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load(args.config.as_deref())?;
    init_telemetry(TelemetryConfig::from_settings(&settings.logging));

    match args.command {
        Command::Hub => run_hub(&settings).await,
        Command::Endpoint { id } => run_endpoint(settings, id).await,
    }
}

fn load(path: Option<&std::path::Path>) -> Result<CourierSettings> {
    match path {
        Some(path) => courier_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => courier_settings::load_settings().context("failed to load settings"),
    }
}

async fn run_hub(settings: &CourierSettings) -> Result<()> {
    let config = HubConfig::from_settings(&settings.hub);
    let metrics = match courier_hub::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics exporter unavailable, /metrics disabled");
            None
        }
    };

    let handle = courier_hub::start(config, metrics)
        .await
        .context("failed to start relay hub")?;
    info!(addr = %handle.local_addr(), "courier hub ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    handle.shutdown().await;
    Ok(())
}

async fn run_endpoint(mut settings: CourierSettings, id: Option<String>) -> Result<()> {
    if let Some(id) = id {
        settings.link.endpoint_id = id;
    }
    let config =
        EndpointConfig::from_settings(&settings.link).context("invalid link settings")?;
    let local_id = config.local_id.clone();

    let endpoint = Endpoint::new(Arc::new(WsTransport), config)
        .with_documents(Arc::new(MemoryStore::new()));
    // Standalone: no peers, so this instance is the primary.
    let _ = endpoint.apply_membership(&[Candidate::new(
        local_id.clone(),
        PRIMARY_TIER,
        true,
    )]);
    info!(endpoint_id = %local_id, relay = %settings.link.relay_url, "courier endpoint started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down");
    if !endpoint.close(SHUTDOWN_GRACE).await {
        warn!(grace_ms = SHUTDOWN_GRACE.as_millis() as u64, "relay link did not close in time");
    }
    Ok(())
}
