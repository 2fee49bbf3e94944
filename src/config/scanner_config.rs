use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::bluetooth::commands::PlaintextLayout;
use crate::core::bluetooth::constants::{
    HEALTH_RESTART_INTERVAL, SCAN_PERIOD, SCANS_PER_PERIOD, TOO_FREQUENT_COOLDOWN,
};
use crate::core::bluetooth::types::ScanMode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScannerConfigError {
    #[error("scans_per_period must be at least 1")]
    ZeroScansPerPeriod,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Scan starts the platform tolerates per window
    pub scans_per_period: usize,
    /// Length of the rolling window, in milliseconds
    pub scan_period_ms: u64,
    /// Back-off after the platform reports scanning too frequently
    pub too_frequent_cooldown_ms: u64,
    /// Periodic restart while idle-scanning; `null` turns it off
    pub health_restart_interval_ms: Option<u64>,
    pub plaintext_layout: PlaintextLayout,
    pub scan_mode: ScanMode,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scans_per_period: SCANS_PER_PERIOD,
            scan_period_ms: SCAN_PERIOD.as_millis() as u64,
            too_frequent_cooldown_ms: TOO_FREQUENT_COOLDOWN.as_millis() as u64,
            health_restart_interval_ms: Some(HEALTH_RESTART_INTERVAL.as_millis() as u64),
            plaintext_layout: PlaintextLayout::default(),
            scan_mode: ScanMode::default(),
        }
    }
}

impl ScannerConfig {
    pub fn validate(&self) -> Result<(), ScannerConfigError> {
        if self.scans_per_period == 0 {
            return Err(ScannerConfigError::ZeroScansPerPeriod);
        }
        if self.scan_period_ms == 0 {
            return Err(ScannerConfigError::ZeroDuration("scan_period_ms"));
        }
        if self.too_frequent_cooldown_ms == 0 {
            return Err(ScannerConfigError::ZeroDuration("too_frequent_cooldown_ms"));
        }
        if self.health_restart_interval_ms == Some(0) {
            return Err(ScannerConfigError::ZeroDuration("health_restart_interval_ms"));
        }
        Ok(())
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }

    pub fn too_frequent_cooldown(&self) -> Duration {
        Duration::from_millis(self.too_frequent_cooldown_ms)
    }

    pub fn health_restart_interval(&self) -> Option<Duration> {
        self.health_restart_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
