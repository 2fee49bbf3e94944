//! Device registry
//! Holds the target devices the client is scanning for. Records are never edited in
//! place: every change builds a new snapshot, so readers holding an older
//! `Arc<[TargetDevice]>` keep a consistent view.

use std::sync::Arc;

use uuid::Uuid;

use crate::core::bluetooth::types::{ScanFilter, TargetDevice};

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<[TargetDevice]>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<TargetDevice>) -> Self {
        Self {
            devices: dedup_by_service(devices).into(),
        }
    }

    /// Read-only view, cheap to clone and safe to hand to other tasks.
    pub fn snapshot(&self) -> Arc<[TargetDevice]> {
        self.devices.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn get(&self, service_id: &Uuid) -> Option<&TargetDevice> {
        self.devices.iter().find(|d| d.service_id == *service_id)
    }

    /// First registered device advertising any of `service_ids`.
    pub fn find_advertised(&self, service_ids: &[Uuid]) -> Option<&TargetDevice> {
        self.devices.iter().find(|device| {
            let filter = ScanFilter::for_service(device.service_id);
            service_ids.iter().any(|id| filter.matches(id))
        })
    }

    /// True when `devices` names the same targets as the registry, in any order.
    /// Observed payloads are not part of a device's identity.
    pub fn same_targets(&self, devices: &[TargetDevice]) -> bool {
        let requested = dedup_by_service(devices.to_vec());
        requested.len() == self.devices.len()
            && requested.iter().all(|wanted| {
                self.get(&wanted.service_id)
                    .is_some_and(|held| held.same_target(wanted))
            })
    }

    /// Replaces the whole contents.
    pub fn replace_all(&mut self, devices: Vec<TargetDevice>) {
        self.devices = dedup_by_service(devices).into();
    }

    /// Replaces one record with a copy carrying `payload`. Returns false if the
    /// device is not registered.
    pub fn record_payload(&mut self, service_id: &Uuid, payload: Vec<u8>) -> bool {
        let Some(index) = self.devices.iter().position(|d| d.service_id == *service_id) else {
            return false;
        };
        let mut next = self.devices.to_vec();
        next[index] = next[index].with_payload(payload);
        self.devices = next.into();
        true
    }

    pub fn scan_filters(&self) -> Vec<ScanFilter> {
        self.devices
            .iter()
            .map(|device| ScanFilter::for_service(device.service_id))
            .collect()
    }

    pub fn to_vec(&self) -> Vec<TargetDevice> {
        self.devices.to_vec()
    }
}

/// Service ids are unique within the registry; the first occurrence wins.
fn dedup_by_service(devices: Vec<TargetDevice>) -> Vec<TargetDevice> {
    let mut unique: Vec<TargetDevice> = Vec::with_capacity(devices.len());
    for device in devices {
        if !unique.iter().any(|d| d.service_id == device.service_id) {
            unique.push(device);
        }
    }
    unique
}
