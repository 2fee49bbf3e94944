//! Inputs to the session state machine.
//!
//! Everything that can change the session is one of these: caller commands, platform
//! callbacks, availability changes and timers. They are all funnelled into the manager's
//! single loop and handled one at a time.

use uuid::Uuid;

use crate::core::bluetooth::types::{
    Advertisement, Availability, DiscoveredService, GattStatus, ScanFailure, SessionId,
    TargetDevice, WriteOutcome,
};
use crate::error::{Permission, PlatformError};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // ── Caller ────────────────────────────────────────────────
    Start(Vec<TargetDevice>),
    Stop,
    RestartIfNotBusy,

    // ── Timers ────────────────────────────────────────────────
    HealthRestart,
    CooldownElapsed,

    // ── Availability gate ─────────────────────────────────────
    Availability(Availability),

    // ── Scanner ───────────────────────────────────────────────
    /// `start_scan` refused synchronously.
    ScanRejected(PlatformError),
    ScanResult(Advertisement),
    ScanFailed(ScanFailure),
    ScanPermissionDenied,

    // ── Connection / bonding, tagged with the attempt they belong to ──
    Gatt { session: SessionId, event: GattEvent },
    Bond { session: SessionId, event: BondEvent },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    /// Link is up. `bonding` is set when the peer is in the middle of pairing.
    Connected { bonding: bool },
    Disconnected,
    Error(GattStatus),
    ServicesDiscovered(Vec<DiscoveredService>),
    DiscoveryFailed,
    Notification { characteristic: Uuid, value: Vec<u8> },
    SignalRead(i16),
    /// Synchronous result of handing the command to the platform.
    WriteIssued(WriteOutcome),
    WriteCompleted { success: bool },
    PermissionDenied(Permission),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondEvent {
    Bonded,
    Failed,
    PermissionDenied,
}
