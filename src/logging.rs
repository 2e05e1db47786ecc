use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .trim()
        .to_ascii_lowercase()
        .parse()
        .with_context(|| format!("invalid log level: {level:?}"))
}

pub fn app_log_file(dir: &Path, started_at: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "sensorlogger_{}.log",
        started_at.format("%Y%m%dT%H%M%SZ")
    ))
}

/// Console logging to stderr plus, with `log_dir`, an uncoloured copy in a
/// per-run file. `RUST_LOG` overrides `level`.
pub fn init_tracing(level: &str, log_dir: Option<&Path>) -> Result<()> {
    let level = parse_level(level)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,sensor_datalogger={level},datalogger={level}"
        ))
    });

    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
            let path = app_log_file(dir, Utc::now());
            let file = File::create(&path)
                .with_context(|| format!("failed to create log file: {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to initialize tracing")?;

    Ok(())
}
