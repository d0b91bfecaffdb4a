use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use relay_server::{ChannelHub, Orchestrator, OrchestratorConfig, ServerConfig};
use relay_settings::RelaySettings;
use relay_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Multi-agent coordination server")]
struct Cli {
    /// Settings file (defaults to ~/.relay/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks a free one)
    #[arg(long)]
    port: Option<u16>,
}

fn load(cli: &Cli) -> anyhow::Result<RelaySettings> {
    let mut settings = match &cli.config {
        Some(path) => relay_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => relay_settings::load_settings().context("loading settings")?,
    };
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let telemetry = init_telemetry(TelemetryConfig::from_level_name(
        &settings.logging.level,
        settings.logging.json,
    ));
    tracing::info!("starting relay");

    let hub = Arc::new(ChannelHub::new(settings.server.channel_capacity));
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::from_settings(&settings),
        Arc::new(hub.connect(settings.orchestrator.id.as_str())),
        telemetry.metrics(),
    );
    let orchestrator_handle = orchestrator
        .start()
        .await
        .context("starting orchestrator")?;

    let server = relay_server::start(
        ServerConfig::from_settings(&settings),
        Arc::clone(&hub),
        Arc::clone(&orchestrator),
    )
    .await
    .context("starting server")?;

    tracing::info!(
        port = server.port,
        channel = %settings.orchestrator.coordination_channel,
        "relay ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    orchestrator_handle.shutdown().await;
    server.shutdown().await;
    Ok(())
}
