use std::path::PathBuf;

use clap::Parser;
use sensor_datalogger::config::DEFAULT_CONFIG_PATH;

#[derive(Debug, Parser)]
#[command(version, about = "Polls UDP sensors and logs their readings to CSV and InfluxDB")]
pub struct Args {
    /// TOML configuration file
    #[arg(env = "DATALOGGER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Seconds to wait for every pipeline stage to stop after a shutdown signal
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}
