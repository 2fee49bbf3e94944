//! Device store
//! Keeps the registry in a JSON file so the daemon comes back with the same devices.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{info, warn};
use tokio::fs;

use crate::core::bluetooth::platform::DeviceStore;
use crate::core::bluetooth::types::TargetDevice;
use crate::error::StoreError;

pub struct JsonDeviceStore {
    path: PathBuf,
}

impl JsonDeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn load(&self) -> Result<Vec<TargetDevice>, StoreError> {
        if !self.path.exists() {
            warn!("Device store {:?} not found, starting empty", self.path);
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&self.path).await?;
        let devices: Vec<TargetDevice> = serde_json::from_str(&json)?;
        info!("Loaded {} device(s) from {:?}", devices.len(), self.path);
        Ok(devices)
    }

    async fn save(&self, devices: &[TargetDevice]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(devices)?;

        // Write next to the target and rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        info!("Saved {} device(s) to {:?}", devices.len(), self.path);
        Ok(())
    }
}
