mod args;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context as _, Result};
use args::Args;
use clap::Parser as _;
use sensor_datalogger::{
    config::Config,
    influx::{DiscardSink, InfluxClient, InfluxWriter, WriteOptions},
    logging::init_tracing,
    pipeline::{Pipeline, PipelineSettings},
    sensor::DeviceRegistry,
};

const EXIT_CONFIG: u8 = 1;
const EXIT_DATA_DIR: u8 = 64;
const EXIT_RUNTIME: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let (config, registry) = match load(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let data_dir = match config.data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::from(EXIT_DATA_DIR);
        }
    };

    let grace = Duration::from_secs(args.shutdown_grace_secs);
    if let Err(e) = run(config, registry, data_dir, grace).await {
        tracing::error!("{e:#}");
        return ExitCode::from(EXIT_RUNTIME);
    }

    ExitCode::SUCCESS
}

fn load(args: &Args) -> Result<(Config, DeviceRegistry)> {
    let config = Config::load(&args.config)?;
    let registry = config.device_registry()?;
    let app_log_dir = config.app_log_dir()?;
    init_tracing(&config.log_level, app_log_dir.as_deref())?;
    Ok((config, registry))
}

async fn run(
    config: Config,
    registry: DeviceRegistry,
    data_dir: PathBuf,
    grace: Duration,
) -> Result<()> {
    if registry.is_empty() {
        tracing::warn!("no Sources configured, nothing will be polled");
    }
    tracing::info!(
        path = %data_dir.display(),
        devices = registry.len(),
        "starting data collector"
    );

    let settings = PipelineSettings::from_config(&config, data_dir);
    let pipeline = if config.influx.enabled {
        let client = InfluxClient::new(&config.influx).context("failed to create InfluxDB client")?;
        let writer = InfluxWriter::spawn(client, WriteOptions::from(&config.influx));
        Pipeline::spawn(settings, registry, writer)
    } else {
        tracing::info!("Log_to_DB is disabled, readings are only written to CSV");
        Pipeline::spawn(settings, registry, DiscardSink)
    };

    shutdown_signal().await?;
    tracing::info!("shutdown signal received");

    pipeline.shutdown(grace).await?;
    tracing::info!("data collector graceful shutdown");

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")
}
