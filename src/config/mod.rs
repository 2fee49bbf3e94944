pub mod scanner_config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::types::TargetDevice;
use crate::utils::ensure_directory_exists;

pub use scanner_config::{ScannerConfig, ScannerConfigError};

pub const CONFIG_FILE_NAME: &str = "proximity-unlock.json";
pub const CONFIG_PATH_ENV: &str = "PROXIMITY_UNLOCK_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default log filter, overridden by `RUST_LOG`
    pub log_level: String,
    /// JSON file the device registry is persisted to
    pub device_store_path: PathBuf,
    pub scanner: ScannerConfig,
    /// Devices to use when the store is empty
    pub devices: Vec<TargetDevice>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_level: "info".to_string(),
            device_store_path: PathBuf::from("devices.json"),
            scanner: ScannerConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Config path from the command line, the environment, or the working directory.
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
    }

    /// Loads the config from a configuration file.
    pub async fn load_config(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("parsing {}", path.display()))?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;

        info!("Config saved to {:?}.", path);
        Ok(())
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
