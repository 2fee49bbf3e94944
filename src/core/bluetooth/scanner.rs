//! Bluetooth scanning on top of bluest
//! This module runs filtered advertisement scans and hands every sighting of a
//! registered service to the state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use bluest::error::ErrorKind;
use bluest::{Adapter, Device, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::platform::{EventSink, PlatformScanner};
use crate::core::bluetooth::types::{Advertisement, PeerId, ScanFailure, ScanRequest};
use crate::error::PlatformError;

/// Devices seen during the current scan, keyed by platform id
pub type DeviceCache = Arc<Mutex<HashMap<String, Device>>>;

pub struct BluestScanner {
    adapter: Adapter,
    devices: DeviceCache,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluestScanner {
    pub fn new(adapter: Adapter, devices: DeviceCache) -> Self {
        Self {
            adapter,
            devices,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    /// Scans until cancelled or the platform ends the stream
    async fn internal_scan_task(
        adapter: Adapter,
        devices: DeviceCache,
        services: Vec<Uuid>,
        sink: EventSink,
        cancel_token: CancellationToken,
    ) {
        info!("Starting bluetooth scan for {} service(s)", services.len());
        let mut scan_stream = match adapter.scan(&services).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start bluetooth scan: {}", e);
                match e.kind() {
                    ErrorKind::NotAuthorized => sink.scan_permission_denied(),
                    kind => sink.scan_failed(scan_failure(kind)),
                }
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(_) if sink.is_closed() => {
                            info!("Event loop is gone, ending scan");
                            break;
                        }
                        Some(discovered_device) => {
                            let Some(rssi) = discovered_device.rssi else {
                                continue;
                            };
                            let device = discovered_device.device;
                            let id = device.id().to_string();
                            let service_ids: Vec<Uuid> =
                                discovered_device.adv_data.services.iter().copied().collect();
                            debug!(
                                "Found device - Address: {}, RSSI: {}, Services: {:?}",
                                extract_mac_address(&id).unwrap_or_else(|| "N/A".to_string()),
                                rssi,
                                service_ids
                            );

                            if let Ok(mut devices) = devices.lock() {
                                devices.insert(id.clone(), device);
                            }
                            sink.scan_result(Advertisement {
                                peer: PeerId(id),
                                service_ids,
                                rssi,
                            });
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    debug!("Scan task cancelled");
                    break;
                }
            }
        }
    }
}

impl PlatformScanner for BluestScanner {
    fn start_scan(&mut self, request: &ScanRequest, sink: EventSink) -> Result<(), PlatformError> {
        if self.scan_task_handle.is_some() {
            self.stop_scan();
        }
        if let Ok(mut devices) = self.devices.lock() {
            devices.clear();
        }

        self.cancel_token = CancellationToken::new();
        let services = request.filters.iter().map(|f| f.service_id).collect();
        let handle = tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            self.devices.clone(),
            services,
            sink,
            self.cancel_token.clone(),
        ));
        self.scan_task_handle = Some(handle);

        info!("Device scan task started ({:?}).", request.settings.mode);
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.cancel_token.cancel();
        match self.scan_task_handle.take() {
            Some(handle) if !handle.is_finished() => info!("Stopping Bluetooth scan."),
            Some(_) => debug!("Scan task had already finished."),
            None => {}
        }
    }
}

impl Drop for BluestScanner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn scan_failure(kind: ErrorKind) -> ScanFailure {
    match kind {
        ErrorKind::AlreadyScanning => ScanFailure::AlreadyStarted,
        ErrorKind::NotSupported => ScanFailure::FeatureUnsupported,
        other => {
            warn!("Unexpected scan error kind: {:?}", other);
            ScanFailure::InternalError
        }
    }
}

fn extract_mac_address(device_id_str: &str) -> Option<String> {
    static MAC: OnceLock<Option<Regex>> = OnceLock::new();
    let re = MAC
        .get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok())
        .as_ref()?;
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().to_uppercase())
}
