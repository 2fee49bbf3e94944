//! Application state management
//! Builds the bluest platform, the availability gate and the device store, and runs
//! the unlock manager on its own task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::Adapter;
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::bluetooth::{
    AvailabilityGate, BluestAvailability, BluestBondManager, BluestConnection, BluestScanner,
    DeviceCache, DeviceStore, Platform, ScannerHandle, TargetDevice, UnlockManager,
};
use crate::core::store::JsonDeviceStore;

const ADAPTER_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    /// Handle to the running unlock manager
    pub scanner: ScannerHandle,
    store: Arc<JsonDeviceStore>,
    manager_task: JoinHandle<()>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing Bluetooth adapter...");
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        // A powered-off radio is not fatal; the gate reports it and scanning waits.
        let radio_enabled =
            match tokio::time::timeout(ADAPTER_READY_TIMEOUT, adapter.wait_available()).await {
                Ok(Ok(())) => {
                    info!("Bluetooth adapter is available.");
                    true
                }
                Ok(Err(e)) => {
                    warn!("Bluetooth adapter is not usable: {}", e);
                    false
                }
                Err(_) => {
                    warn!("Bluetooth adapter is off, waiting for it to come up");
                    false
                }
            };

        let devices: DeviceCache = Arc::default();
        let platform = Platform {
            scanner: Box::new(BluestScanner::new(adapter.clone(), devices.clone())),
            connection: Box::new(BluestConnection::new(adapter.clone(), devices.clone())),
            bonds: Box::new(BluestBondManager::new(devices)),
        };
        let gate = AvailabilityGate::new(Arc::new(BluestAvailability::new(adapter, radio_enabled)));
        let store = Arc::new(JsonDeviceStore::new(config.device_store_path.clone()));

        let (scanner, manager_task) = UnlockManager::spawn(
            platform,
            gate,
            Some(store.clone() as Arc<dyn DeviceStore>),
            &config.scanner,
        );
        Ok(Self {
            config,
            scanner,
            store,
            manager_task,
        })
    }

    /// Devices persisted by a previous run, or the configured ones when there are none.
    pub async fn initial_devices(&self) -> Vec<TargetDevice> {
        match self.store.load().await {
            Ok(devices) if !devices.is_empty() => devices,
            Ok(_) => self.config.devices.clone(),
            Err(e) => {
                error!("Failed to load device store {:?}: {}", self.store.path(), e);
                self.config.devices.clone()
            }
        }
    }

    /// Stops the manager and waits for it to release the radio.
    pub async fn shutdown(self) -> Result<()> {
        self.scanner.shutdown()?;
        self.manager_task.await?;
        info!("Unlock manager stopped");
        Ok(())
    }
}
