use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use easel_settings::{load_settings_from_path, settings_path};
use easel_telemetry::{init_telemetry, with_bootstrap_logging, TelemetryConfig};

/// Collaborative drawing server.
#[derive(Debug, Parser)]
#[command(name = "easel", version)]
struct Args {
    /// Settings file (defaults to ~/.easel/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the TCP listening port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the health/stats HTTP port.
    #[arg(long)]
    health_port: Option<u16>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = args.config.unwrap_or_else(settings_path);
    let mut settings = with_bootstrap_logging(|| load_settings_from_path(&path))
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(port) = args.health_port {
        settings.server.health_port = port;
    }

    let telemetry = init_telemetry(TelemetryConfig::from_level_name(
        &settings.logging.level,
        settings.logging.json || args.json_logs,
    ));
    tracing::info!(path = %path.display(), "Starting easel server");

    let handle = easel_server::start(&settings, telemetry.metrics())
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port(), "Easel server ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
