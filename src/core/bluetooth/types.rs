//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_RSSI_THRESHOLD, GATT_CONNECTION_CONGESTED, GATT_CONNECTION_TIMEOUT,
    GATT_FIRMWARE_ERROR, GATT_INSUFFICIENT_AUTHENTICATION, GATT_INSUFFICIENT_ENCRYPTION,
    GATT_LINK_TIMEOUT, SCAN_FAILED_ALREADY_STARTED, SCAN_FAILED_APPLICATION_REGISTRATION_FAILED,
    SCAN_FAILED_FEATURE_UNSUPPORTED, SCAN_FAILED_INTERNAL_ERROR,
    SCAN_FAILED_OUT_OF_HARDWARE_RESOURCES, SCAN_FAILED_SCANNING_TOO_FREQUENTLY, SERVICE_UUID_MASK,
};

/// A door controller we know how to unlock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDevice {
    /// Advertised service UUID, also the GATT service we expect after connecting
    pub service_id: Uuid,
    /// Signal strength (dBm) required before we connect and write
    #[serde(default = "default_rssi_threshold")]
    pub rssi_threshold: i16,
    /// Device key, placed into the plaintext block
    #[serde(with = "text_or_bytes")]
    pub key_material: Vec<u8>,
    /// AES key
    #[serde(with = "text_or_bytes")]
    pub static_code: Vec<u8>,
    /// Latest payload notified by the controller, header stripped
    #[serde(default)]
    pub last_payload: Vec<u8>,
}

fn default_rssi_threshold() -> i16 {
    DEFAULT_RSSI_THRESHOLD
}

impl TargetDevice {
    pub fn new(
        service_id: Uuid,
        rssi_threshold: i16,
        key_material: impl Into<Vec<u8>>,
        static_code: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            service_id,
            rssi_threshold,
            key_material: key_material.into(),
            static_code: static_code.into(),
            last_payload: Vec::new(),
        }
    }

    /// Returns a copy of this record carrying a new payload.
    pub fn with_payload(&self, payload: Vec<u8>) -> Self {
        Self {
            last_payload: payload,
            ..self.clone()
        }
    }

    /// Same device and secrets, ignoring the observed payload.
    pub fn same_target(&self, other: &TargetDevice) -> bool {
        self.service_id == other.service_id
            && self.rssi_threshold == other.rssi_threshold
            && self.key_material == other.key_material
            && self.static_code == other.static_code
    }

    pub fn accepts_signal(&self, rssi: i16) -> bool {
        rssi >= self.rssi_threshold
    }
}

/// Keys are usually printable, so keep them readable in JSON and fall back to a byte array.
mod text_or_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(bytes),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}

/// Why the client is not scanning right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    IncorrectConfiguration,
    ConnectionFailed,
    BluetoothOff,
    LocationOff,
    BluetoothAndLocationOff,
    NoScanPermission,
    NoConnectPermission,
    BluetoothStackBadState,
    FeatureNotSupported,
    ScanningTooFrequently,
    ScanFailedUnknownError,
    ConnectionCongested,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncorrectConfiguration => "incorrect_configuration",
            Self::ConnectionFailed => "connection_failed",
            Self::BluetoothOff => "bluetooth_off",
            Self::LocationOff => "location_off",
            Self::BluetoothAndLocationOff => "bluetooth_and_location_off",
            Self::NoScanPermission => "no_scan_permission",
            Self::NoConnectPermission => "no_connect_permission",
            Self::BluetoothStackBadState => "bluetooth_stack_bad_state",
            Self::FeatureNotSupported => "feature_not_supported",
            Self::ScanningTooFrequently => "scanning_too_frequently",
            Self::ScanFailedUnknownError => "scan_failed_unknown_error",
            Self::ConnectionCongested => "connection_congested",
        }
    }

    /// Failures that only an explicit `start()`/`restart_if_not_busy()` can clear.
    pub fn needs_external_action(&self) -> bool {
        matches!(
            self,
            Self::IncorrectConfiguration
                | Self::NoScanPermission
                | Self::NoConnectPermission
                | Self::BluetoothStackBadState
                | Self::FeatureNotSupported
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single scan/connect session owned by the state machine
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanSession {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Reconnecting,
    Connected { device_id: Uuid, signal: Option<i16> },
    Failed { reason: FailureReason },
}

impl ScanSession {
    /// A connection attempt or open GATT session exists.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Reconnecting | Self::Connected { .. }
        )
    }
}

impl fmt::Display for ScanSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Scanning => f.write_str("Scanning"),
            Self::Connecting => f.write_str("Connecting"),
            Self::Reconnecting => f.write_str("Reconnecting"),
            Self::Connected {
                device_id,
                signal: Some(signal),
            } => write!(f, "Connected({device_id}, {signal} dBm)"),
            Self::Connected { device_id, .. } => write!(f, "Connected({device_id})"),
            Self::Failed { reason } => write!(f, "Failed({reason})"),
        }
    }
}

/// Radio and location state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub radio_enabled: bool,
    pub location_enabled: bool,
}

impl Availability {
    pub const ON: Availability = Availability {
        radio_enabled: true,
        location_enabled: true,
    };

    pub fn new(radio_enabled: bool, location_enabled: bool) -> Self {
        Self {
            radio_enabled,
            location_enabled,
        }
    }

    pub fn both_on(&self) -> bool {
        self.radio_enabled && self.location_enabled
    }

    /// The failure this snapshot forces, if any.
    pub fn failure(&self) -> Option<FailureReason> {
        match (self.radio_enabled, self.location_enabled) {
            (true, true) => None,
            (false, true) => Some(FailureReason::BluetoothOff),
            (true, false) => Some(FailureReason::LocationOff),
            (false, false) => Some(FailureReason::BluetoothAndLocationOff),
        }
    }
}

/// Platform identifier of a remote peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one connection attempt. Callbacks carry it so stale ones can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_id: Uuid,
    pub service_mask: Uuid,
}

impl ScanFilter {
    pub fn for_service(service_id: Uuid) -> Self {
        Self {
            service_id,
            service_mask: SERVICE_UUID_MASK,
        }
    }

    pub fn matches(&self, candidate: &Uuid) -> bool {
        let mask = self.service_mask.as_u128();
        self.service_id.as_u128() & mask == candidate.as_u128() & mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    LowPower,
    Balanced,
    #[default]
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanSettings {
    pub mode: ScanMode,
}

/// Everything needed to issue one platform scan start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub filters: Vec<ScanFilter>,
    pub settings: ScanSettings,
}

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub peer: PeerId,
    pub service_ids: Vec<Uuid>,
    pub rssi: i16,
}

/// A GATT service found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Status attached to a GATT failure callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    InsufficientAuthentication,
    InsufficientEncryption,
    InsufficientAuthorization,
    ConnectionCongested,
    ConnectionTimeout,
    FirmwareError,
    Other(i32),
}

impl GattStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            GATT_INSUFFICIENT_AUTHENTICATION => Self::InsufficientAuthentication,
            GATT_INSUFFICIENT_ENCRYPTION => Self::InsufficientEncryption,
            GATT_CONNECTION_CONGESTED => Self::ConnectionCongested,
            GATT_CONNECTION_TIMEOUT | GATT_LINK_TIMEOUT => Self::ConnectionTimeout,
            GATT_FIRMWARE_ERROR => Self::FirmwareError,
            other => Self::Other(other),
        }
    }

    /// The link needs bonding before the peripheral will talk to us.
    pub fn requires_bonding(&self) -> bool {
        matches!(
            self,
            Self::InsufficientAuthentication
                | Self::InsufficientEncryption
                | Self::InsufficientAuthorization
        )
    }

    /// The failure surfaced before the session is rescanned.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::ConnectionCongested => FailureReason::ConnectionCongested,
            _ => FailureReason::ConnectionFailed,
        }
    }
}

/// Reason a platform scan could not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    AlreadyStarted,
    ApplicationRegistrationFailed,
    InternalError,
    FeatureUnsupported,
    OutOfHardwareResources,
    ScanningTooFrequently,
    Other(i32),
}

impl ScanFailure {
    pub fn from_code(code: i32) -> Self {
        match code {
            SCAN_FAILED_ALREADY_STARTED => Self::AlreadyStarted,
            SCAN_FAILED_APPLICATION_REGISTRATION_FAILED => Self::ApplicationRegistrationFailed,
            SCAN_FAILED_INTERNAL_ERROR => Self::InternalError,
            SCAN_FAILED_FEATURE_UNSUPPORTED => Self::FeatureUnsupported,
            SCAN_FAILED_OUT_OF_HARDWARE_RESOURCES => Self::OutOfHardwareResources,
            SCAN_FAILED_SCANNING_TOO_FREQUENTLY => Self::ScanningTooFrequently,
            other => Self::Other(other),
        }
    }
}

/// Result of issuing a characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Issued,
    Busy,
    Failed,
}
