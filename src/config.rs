// Client configuration: JSON file in the config directory, then environment overrides.

use anyhow::{anyhow, Context, Result};
use log::{info, LevelFilter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::chat::DEFAULT_OFFER_EXPIRY_MINUTES;

pub const APP_DIR: &str = "barberline";
pub const CONFIG_FILE: &str = "config.json";

pub const ENV_CONFIG: &str = "BARBERLINE_CONFIG";
pub const ENV_POLL_INTERVAL_MS: &str = "BARBERLINE_POLL_INTERVAL_MS";
pub const ENV_DATA_DIR: &str = "BARBERLINE_DATA_DIR";
pub const ENV_LOG_LEVEL: &str = "BARBERLINE_LOG_LEVEL";

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config loading at a specific file (the `--config` flag)
pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How often an active service request is re-fetched
    pub poll_interval_ms: u64,
    /// Upper bound for one fetch; 0 disables the bound
    pub fetch_timeout_ms: u64,
    /// Lifetime of a monetary offer sent in chat
    pub offer_expiry_minutes: i64,
    pub nearby_radius_km: f64,
    pub channel_capacity: usize,
    pub data_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            poll_interval_ms: 3000,
            fetch_timeout_ms: 10_000,
            offer_expiry_minutes: DEFAULT_OFFER_EXPIRY_MINUTES,
            nearby_radius_km: 10.0,
            channel_capacity: 100,
            data_dir: None,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        match self.fetch_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn log_level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }

    /// Where persisted stores live
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join(APP_DIR);
        Ok(dir)
    }

    /// Load from the override path, `$BARBERLINE_CONFIG`, or the default location.
    /// A missing file yields defaults; environment overrides apply last.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: ClientConfig = serde_json::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            ClientConfig::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = value
                .parse()
                .with_context(|| format!("{} must be a number of milliseconds", ENV_POLL_INTERVAL_MS))?;
        }
        if let Ok(value) = env::var(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var(ENV_LOG_LEVEL) {
            self.log_level = value;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

fn config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var(ENV_CONFIG) {
        return Ok(PathBuf::from(path));
    }
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_DIR)
        .join(CONFIG_FILE))
}
