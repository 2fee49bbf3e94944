//! Constants used throughout the unlock client
//! This module contains the fixed protocol values shared with the door controller
//! firmware, the platform status codes we react to, and timing defaults.

use std::time::Duration;

use uuid::Uuid;

/// Characteristic the encrypted unlock command is written to
pub const UUID_UNLOCK_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000f401_0000_1000_8000_00805f9b34fb);

/// Characteristic the controller broadcasts its rolling payload on
pub const UUID_UNLOCK_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000f402_0000_1000_8000_00805f9b34fb);

/// Scan filter mask: every bit of the service UUID must match.
pub const SERVICE_UUID_MASK: Uuid = Uuid::from_u128(u128::MAX);

/// Common prefix of SKUD controller service UUIDs. The last group is the controller id.
pub const SKUD_SERVICE_UUID_PREFIX: &str = "f45389a8-d158-4964-b8ef-";

/// Default signal strength a device must reach before we connect and unlock.
pub const DEFAULT_RSSI_THRESHOLD: i16 = -75;

/// Bytes of framing in front of every notification payload.
pub const NOTIFY_HEADER_LEN: usize = 1;

/// AES block and key size.
pub const COMMAND_BLOCK_LEN: usize = 16;

/// Platform quota: scan starts allowed per period.
pub const SCANS_PER_PERIOD: usize = 5;

/// Platform quota window.
pub const SCAN_PERIOD: Duration = Duration::from_secs(30);

/// How long to back off after the platform reports scanning too frequently.
pub const TOO_FREQUENT_COOLDOWN: Duration = Duration::from_secs(30);

/// Interval of the periodic health restart.
pub const HEALTH_RESTART_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// GATT status codes
pub const GATT_INSUFFICIENT_AUTHENTICATION: i32 = 0x05;
pub const GATT_CONNECTION_TIMEOUT: i32 = 0x08;
pub const GATT_INSUFFICIENT_ENCRYPTION: i32 = 0x0f;
pub const GATT_FIRMWARE_ERROR: i32 = 0x85;
pub const GATT_CONNECTION_CONGESTED: i32 = 0x8f;
pub const GATT_LINK_TIMEOUT: i32 = 0x93;

/// Scan failure codes
pub const SCAN_FAILED_ALREADY_STARTED: i32 = 1;
pub const SCAN_FAILED_APPLICATION_REGISTRATION_FAILED: i32 = 2;
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;
pub const SCAN_FAILED_FEATURE_UNSUPPORTED: i32 = 4;
pub const SCAN_FAILED_OUT_OF_HARDWARE_RESOURCES: i32 = 5;
pub const SCAN_FAILED_SCANNING_TOO_FREQUENTLY: i32 = 6;

/// Builds the service UUID of a SKUD controller from its numeric id.
pub fn skud_service_uuid(controller_id: u64) -> Option<Uuid> {
    if controller_id > 0xffff_ffff_ffff {
        return None;
    }
    let text = format!("{}{:012x}", SKUD_SERVICE_UUID_PREFIX, controller_id);
    Uuid::parse_str(&text).ok()
}
