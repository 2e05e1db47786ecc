use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use serde::Deserialize;

use crate::sensor::{Device, DeviceRegistry};

pub const DEFAULT_CONFIG_PATH: &str = "./cfg/config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "Log_Level", default = "default_log_level")]
    pub log_level: String,

    /// Directory for the daily CSV files. May start with `~/`.
    #[serde(rename = "Path_Data_Log")]
    pub data_path: String,

    /// Directory for the diagnostic log file; console only when unset. May
    /// start with `~/`.
    #[serde(rename = "Path_App_Log", default)]
    pub app_log_path: Option<String>,

    #[serde(rename = "Sources", default)]
    pub sources: Vec<SourceConfig>,

    #[serde(rename = "Poll_Interval_Secs", default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(rename = "Check_Interval_Secs", default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(rename = "Query_Timeout_Ms", default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(flatten)]
    pub influx: InfluxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "ID")]
    pub id: u8,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Address")]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    #[serde(rename = "Log_to_DB", default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "DB_Url", default)]
    pub url: String,

    #[serde(rename = "DB_Token", default)]
    pub token: String,

    #[serde(rename = "DB_Org", default)]
    pub org: String,

    #[serde(rename = "DB_Bucket", default)]
    pub bucket: String,

    #[serde(rename = "DB_Batch_Size", default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(rename = "DB_Flush_Interval_Ms", default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(rename = "DB_Retry_Buffer_Limit", default = "default_retry_buffer_limit")]
    pub retry_buffer_limit: usize,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to load config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            bail!("Check_Interval_Secs must be greater than zero");
        }
        if self.query_timeout_ms == 0 {
            bail!("Query_Timeout_Ms must be greater than zero");
        }

        let influx = &self.influx;
        if influx.enabled {
            for (key, value) in [
                ("DB_Url", &influx.url),
                ("DB_Token", &influx.token),
                ("DB_Org", &influx.org),
                ("DB_Bucket", &influx.bucket),
            ] {
                if value.trim().is_empty() {
                    bail!("{key} is required when Log_to_DB is enabled");
                }
            }
            if influx.batch_size == 0 {
                bail!("DB_Batch_Size must be greater than zero");
            }
            if influx.flush_interval_ms == 0 {
                bail!("DB_Flush_Interval_Ms must be greater than zero");
            }
        }

        Ok(())
    }

    pub fn device_registry(&self) -> Result<DeviceRegistry> {
        DeviceRegistry::new(
            self.sources
                .iter()
                .map(|s| Device::new(s.id, s.name.trim(), s.address.trim())),
        )
        .context("invalid Sources")
    }

    /// Resolves `Path_Data_Log` and checks that it is an existing directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let path = expand_home(self.data_path.trim())?;
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("invalid path '{}'", path.display()))?;
        if !metadata.is_dir() {
            bail!("invalid path '{}': not a directory", path.display());
        }
        Ok(path)
    }

    /// Resolves `Path_App_Log`. The directory is created when logging starts.
    pub fn app_log_dir(&self) -> Result<Option<PathBuf>> {
        self.app_log_path
            .as_deref()
            .map(|path| expand_home(path.trim()))
            .transpose()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl InfluxConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    let Some(rest) = path.strip_prefix("~/") else {
        return Ok(PathBuf::from(path));
    };
    let home = env::var_os("HOME").ok_or_else(|| anyhow!("HOME is not set, cannot expand '~/'"))?;
    Ok(PathBuf::from(home).join(rest))
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_check_interval_secs() -> u64 {
    1
}

fn default_query_timeout_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    20
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_retry_buffer_limit() -> usize {
    10_000
}
