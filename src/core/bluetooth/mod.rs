//! Bluetooth proximity unlock
//! This module handles scanning for registered locks, opening a GATT session to the
//! closest one in range and writing the encrypted unlock command.

pub mod availability;
pub mod commands;
pub mod connection;
pub mod constants;
pub mod device;
pub mod events;
pub mod machine;
pub mod manager;
pub mod notification;
pub mod platform;
pub mod radio;
pub mod rate_limiter;
pub mod scanner;
pub mod types;

// Re-export types that should be publicly accessible
pub use availability::{
    AvailabilityGate, AvailabilityPublisher, AvailabilitySource, AvailabilitySubscription,
    ManualAvailability,
};
pub use commands::{PlaintextLayout, UnlockCommand};
pub use connection::{BluestBondManager, BluestConnection};
pub use constants::*; // Re-export all constants
pub use device::DeviceRegistry;
pub use events::{BondEvent, Event, GattEvent};
pub use machine::{Effect, MachineSettings, SessionMachine};
pub use manager::{ScannerHandle, UnlockManager};
pub use platform::{BondManager, DeviceStore, EventSink, Platform, PlatformConnection, PlatformScanner};
pub use radio::BluestAvailability;
pub use rate_limiter::ScanRateLimiter;
pub use scanner::{BluestScanner, DeviceCache};
pub use types::{
    Advertisement, Availability, DiscoveredService, FailureReason, GattStatus, PeerId,
    ScanFailure, ScanFilter, ScanMode, ScanRequest, ScanSession, ScanSettings, SessionId,
    TargetDevice, WriteOutcome,
};
