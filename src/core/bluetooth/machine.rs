//! Session state machine
//! Pure transition logic for the scan → connect → bond → discover → subscribe →
//! read signal → write command cycle. `SessionMachine::handle` maps one event to the
//! next `ScanSession` plus the side effects the manager has to carry out. Nothing in
//! here performs I/O or looks at a clock.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ScannerConfig;
use crate::core::bluetooth::commands::{PlaintextLayout, UnlockCommand, encode};
use crate::core::bluetooth::constants::{
    NOTIFY_HEADER_LEN, UUID_UNLOCK_NOTIFY_CHAR, UUID_UNLOCK_WRITE_CHAR,
};
use crate::core::bluetooth::device::DeviceRegistry;
use crate::core::bluetooth::events::{BondEvent, Event, GattEvent};
use crate::core::bluetooth::types::{
    Advertisement, Availability, DiscoveredService, FailureReason, GattStatus, PeerId,
    ScanFailure, ScanRequest, ScanSession, ScanSettings, SessionId, TargetDevice, WriteOutcome,
};
use crate::error::{Permission, PlatformError};

/// Work the manager performs on behalf of the machine, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// The session moved to a new state.
    Publish(ScanSession),
    DevicesChanged(Arc<[TargetDevice]>),
    PersistDevices(Vec<TargetDevice>),
    WatchAvailability,
    UnwatchAvailability,
    /// Queue a scan start behind the rate limiter.
    ScheduleScan(ScanRequest),
    /// Stop the running scan and drop queued scan starts.
    StopScan,
    Connect { session: SessionId, peer: PeerId },
    DiscoverServices(SessionId),
    SetNotify { session: SessionId, characteristic: Uuid },
    ReadSignal(SessionId),
    WriteCommand {
        session: SessionId,
        characteristic: Uuid,
        command: UnlockCommand,
    },
    CreateBond { session: SessionId, peer: PeerId },
    WatchBond { session: SessionId, peer: PeerId },
    UnwatchBond(SessionId),
    CloseSession(SessionId),
    StartCooldown(Duration),
    CancelCooldown,
    ArmHealthRestart(Duration),
    DisarmHealthRestart,
}

/// The one connection attempt the machine may own at a time
#[derive(Debug, Clone)]
struct Link {
    session: SessionId,
    peer: PeerId,
    device_id: Uuid,
    bond_attempted: bool,
    watching_bond: bool,
    unlock_char: Option<Uuid>,
    notify_char: Option<Uuid>,
    command_sent: bool,
}

#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub cooldown: Duration,
    pub health_restart: Option<Duration>,
    pub layout: PlaintextLayout,
    pub scan_settings: ScanSettings,
    /// A rejected configuration makes every start fail with `IncorrectConfiguration`.
    pub valid: bool,
}

impl From<&ScannerConfig> for MachineSettings {
    fn from(config: &ScannerConfig) -> Self {
        let valid = match config.validate() {
            Ok(()) => true,
            Err(e) => {
                error!("Scanner configuration rejected: {}", e);
                false
            }
        };
        Self {
            cooldown: config.too_frequent_cooldown(),
            health_restart: config.health_restart_interval(),
            layout: config.plaintext_layout,
            scan_settings: ScanSettings {
                mode: config.scan_mode,
            },
            valid,
        }
    }
}

pub struct SessionMachine {
    state: ScanSession,
    registry: DeviceRegistry,
    settings: MachineSettings,
    running: bool,
    watching_availability: bool,
    /// Last availability seen on the current subscription
    availability: Option<Availability>,
    /// A scan is owed once the first snapshot of the subscription arrives.
    scan_on_snapshot: bool,
    cooling_down: bool,
    link: Option<Link>,
    next_session: u64,
}

impl SessionMachine {
    pub fn new(settings: MachineSettings) -> Self {
        Self {
            state: ScanSession::Idle,
            registry: DeviceRegistry::default(),
            settings,
            running: false,
            watching_availability: false,
            availability: None,
            scan_on_snapshot: false,
            cooling_down: false,
            link: None,
            next_session: 0,
        }
    }

    pub fn state(&self) -> &ScanSession {
        &self.state
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooling_down
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.link.as_ref().map(|link| link.session)
    }

    /// Applies one event and returns the resulting side effects.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            Event::Start(devices) => self.on_start(devices, &mut fx),
            Event::Stop => self.on_stop(&mut fx),
            Event::RestartIfNotBusy => self.on_restart_if_not_busy(&mut fx),
            Event::HealthRestart => {
                if self.running {
                    self.on_restart_if_not_busy(&mut fx);
                }
            }
            Event::CooldownElapsed => self.on_cooldown_elapsed(&mut fx),
            Event::Availability(availability) => self.on_availability(availability, &mut fx),
            Event::ScanRejected(err) => self.on_scan_rejected(err, &mut fx),
            Event::ScanPermissionDenied => {
                if self.state == ScanSession::Scanning {
                    self.fail_scan(FailureReason::NoScanPermission, &mut fx);
                }
            }
            Event::ScanResult(advertisement) => self.on_scan_result(advertisement, &mut fx),
            Event::ScanFailed(failure) => self.on_scan_failed(failure, &mut fx),
            Event::Gatt { session, event } => {
                if self.owns(session) {
                    self.on_gatt(event, &mut fx);
                } else {
                    debug!("Ignoring late GATT callback from session {}: {:?}", session, event);
                }
            }
            Event::Bond { session, event } => {
                if self.owns(session) {
                    self.on_bond(event, &mut fx);
                } else {
                    debug!("Ignoring late bond callback from session {}: {:?}", session, event);
                }
            }
        }
        fx
    }

    // ── Caller operations ─────────────────────────────────────

    fn on_start(&mut self, devices: Vec<TargetDevice>, fx: &mut Vec<Effect>) {
        if devices.is_empty() {
            debug!("Start requested with no devices, ignoring");
            return;
        }

        let same_targets = self.registry.same_targets(&devices);
        if self.running && same_targets && !self.needs_fresh_start() {
            debug!("Already scanning for these devices");
            return;
        }

        if !self.settings.valid {
            self.teardown(fx);
            self.enter(
                ScanSession::Failed {
                    reason: FailureReason::IncorrectConfiguration,
                },
                fx,
            );
            return;
        }

        self.teardown(fx);
        if !same_targets {
            self.registry.replace_all(devices);
            info!("Scanning for {} device(s)", self.registry.len());
            fx.push(Effect::PersistDevices(self.registry.to_vec()));
            fx.push(Effect::DevicesChanged(self.registry.snapshot()));
        }
        self.resume(fx);
    }

    fn on_stop(&mut self, fx: &mut Vec<Effect>) {
        self.teardown(fx);
        if self.watching_availability {
            fx.push(Effect::UnwatchAvailability);
            self.watching_availability = false;
            self.availability = None;
        }
        self.scan_on_snapshot = false;
        if self.running {
            fx.push(Effect::DisarmHealthRestart);
        }
        self.running = false;
        self.enter(ScanSession::Idle, fx);
    }

    fn on_restart_if_not_busy(&mut self, fx: &mut Vec<Effect>) {
        if self.state.is_busy() {
            debug!("Restart skipped, session is busy ({})", self.state);
            return;
        }
        if self.registry.is_empty() {
            debug!("Restart skipped, no devices registered");
            return;
        }
        if !self.settings.valid {
            self.enter(
                ScanSession::Failed {
                    reason: FailureReason::IncorrectConfiguration,
                },
                fx,
            );
            return;
        }

        self.teardown(fx);
        self.enter(ScanSession::Idle, fx);
        self.resume(fx);
    }

    /// Not yet scanning, or parked on a failure only an explicit start can clear.
    fn needs_fresh_start(&self) -> bool {
        match &self.state {
            ScanSession::Idle => true,
            ScanSession::Failed { reason } => reason.needs_external_action(),
            _ => false,
        }
    }

    /// Marks the machine running and re-enters scanning once availability allows it.
    fn resume(&mut self, fx: &mut Vec<Effect>) {
        if !self.watching_availability {
            fx.push(Effect::WatchAvailability);
            self.watching_availability = true;
        }
        if !self.running {
            if let Some(interval) = self.settings.health_restart {
                fx.push(Effect::ArmHealthRestart(interval));
            }
        }
        self.running = true;
        self.scan_when_available(fx);
    }

    /// Scans now if the current subscription has reported, otherwise on its first snapshot.
    fn scan_when_available(&mut self, fx: &mut Vec<Effect>) {
        if self.availability.is_none() {
            debug!("Waiting for the first availability snapshot");
            self.scan_on_snapshot = true;
            return;
        }
        self.begin_scan(fx);
    }

    // ── Availability ──────────────────────────────────────────

    fn on_availability(&mut self, availability: Availability, fx: &mut Vec<Effect>) {
        if !self.watching_availability {
            debug!("Ignoring availability update while unsubscribed");
            return;
        }
        let previous = self.availability.replace(availability);
        let owed = std::mem::take(&mut self.scan_on_snapshot);

        if let Some(reason) = availability.failure() {
            warn!("Radio unavailable: {}", reason);
            self.teardown(fx);
            self.enter(ScanSession::Failed { reason }, fx);
            return;
        }

        if owed {
            if self.running && !self.state.is_busy() {
                self.begin_scan(fx);
            }
            return;
        }

        // The first snapshot of a subscription is not a recovery.
        let recovered = previous.is_some_and(|previous| !previous.both_on());
        if recovered && !self.state.is_busy() && self.running {
            info!("Bluetooth and location are back, restarting scan");
            self.teardown(fx);
            self.enter(ScanSession::Idle, fx);
            self.begin_scan(fx);
        }
    }

    // ── Scanning ──────────────────────────────────────────────

    fn on_scan_rejected(&mut self, err: PlatformError, fx: &mut Vec<Effect>) {
        if self.state != ScanSession::Scanning {
            return;
        }
        match err {
            PlatformError::PermissionDenied(_) => {
                self.fail_scan(FailureReason::NoScanPermission, fx)
            }
            other => {
                warn!("Scan start refused: {}", other);
                self.on_scan_failed(ScanFailure::InternalError, fx);
            }
        }
    }

    fn on_scan_result(&mut self, advertisement: Advertisement, fx: &mut Vec<Effect>) {
        if self.state != ScanSession::Scanning {
            debug!(
                "Ignoring advertisement from {} while {}",
                advertisement.peer, self.state
            );
            return;
        }
        let Some(device) = self.registry.find_advertised(&advertisement.service_ids) else {
            return;
        };
        if !device.accepts_signal(advertisement.rssi) {
            debug!(
                "Device {} at {} dBm, below threshold {} dBm",
                device.service_id, advertisement.rssi, device.rssi_threshold
            );
            return;
        }

        let device_id = device.service_id;
        let session = self.allocate_session();
        info!(
            "Device {} in range at {} dBm, connecting to {} (session {})",
            device_id, advertisement.rssi, advertisement.peer, session
        );
        self.link = Some(Link {
            session,
            peer: advertisement.peer.clone(),
            device_id,
            bond_attempted: false,
            watching_bond: false,
            unlock_char: None,
            notify_char: None,
            command_sent: false,
        });
        fx.push(Effect::StopScan);
        fx.push(Effect::Connect {
            session,
            peer: advertisement.peer,
        });
        self.enter(ScanSession::Connecting, fx);
    }

    fn on_scan_failed(&mut self, failure: ScanFailure, fx: &mut Vec<Effect>) {
        if self.state != ScanSession::Scanning {
            debug!("Ignoring scan failure {:?} while {}", failure, self.state);
            return;
        }
        warn!("Scan failed: {:?}", failure);
        match failure {
            ScanFailure::AlreadyStarted => {}
            ScanFailure::ApplicationRegistrationFailed | ScanFailure::OutOfHardwareResources => {
                self.fail_scan(FailureReason::BluetoothStackBadState, fx)
            }
            ScanFailure::FeatureUnsupported => {
                self.fail_scan(FailureReason::FeatureNotSupported, fx)
            }
            ScanFailure::InternalError | ScanFailure::Other(_) => {
                self.enter(
                    ScanSession::Failed {
                        reason: FailureReason::ScanFailedUnknownError,
                    },
                    fx,
                );
                self.begin_scan(fx);
            }
            ScanFailure::ScanningTooFrequently => {
                self.fail_scan(FailureReason::ScanningTooFrequently, fx);
                if self.watching_availability {
                    fx.push(Effect::UnwatchAvailability);
                    self.watching_availability = false;
                    self.availability = None;
                }
                self.cooling_down = true;
                info!(
                    "Cooling down for {:?} before scanning again",
                    self.settings.cooldown
                );
                fx.push(Effect::StartCooldown(self.settings.cooldown));
            }
        }
    }

    fn on_cooldown_elapsed(&mut self, fx: &mut Vec<Effect>) {
        if !self.cooling_down || !self.running {
            return;
        }
        self.cooling_down = false;
        if self.state.is_busy() {
            return;
        }
        info!("Scan cooldown over, resuming");
        fx.push(Effect::WatchAvailability);
        self.watching_availability = true;
        self.scan_when_available(fx);
    }

    // ── GATT session ──────────────────────────────────────────

    fn on_gatt(&mut self, event: GattEvent, fx: &mut Vec<Effect>) {
        match event {
            GattEvent::Connected { bonding } => self.on_connected(bonding, fx),
            GattEvent::Disconnected => {
                if self.state == ScanSession::Reconnecting {
                    debug!("Link dropped while bonding");
                    return;
                }
                info!("Device disconnected, scanning again");
                self.close_link(fx);
                self.begin_scan(fx);
            }
            GattEvent::Error(status) => self.on_gatt_error(status, fx),
            GattEvent::ServicesDiscovered(services) => self.on_services(&services, fx),
            GattEvent::DiscoveryFailed => {
                warn!("Service discovery failed");
                self.close_link(fx);
                self.begin_scan(fx);
            }
            GattEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, value, fx),
            GattEvent::SignalRead(rssi) => self.on_signal(rssi, fx),
            GattEvent::WriteIssued(outcome) => self.on_write_issued(outcome, fx),
            GattEvent::WriteCompleted { success } => {
                if success {
                    info!("Unlock command delivered");
                } else {
                    warn!("Unlock command write was not acknowledged");
                }
            }
            GattEvent::PermissionDenied(permission) => {
                let reason = match permission {
                    Permission::Scan => FailureReason::NoScanPermission,
                    Permission::Connect => FailureReason::NoConnectPermission,
                };
                self.teardown(fx);
                self.enter(ScanSession::Failed { reason }, fx);
            }
        }
    }

    fn on_connected(&mut self, bonding: bool, fx: &mut Vec<Effect>) {
        if self.state != ScanSession::Connecting {
            debug!("Unexpected connect callback while {}", self.state);
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if bonding {
            info!("Device {} is pairing, waiting for the bond", link.device_id);
            link.watching_bond = true;
            fx.push(Effect::WatchBond {
                session: link.session,
                peer: link.peer.clone(),
            });
            self.enter(ScanSession::Reconnecting, fx);
        } else {
            let device_id = link.device_id;
            fx.push(Effect::DiscoverServices(link.session));
            self.enter(
                ScanSession::Connected {
                    device_id,
                    signal: None,
                },
                fx,
            );
        }
    }

    fn on_gatt_error(&mut self, status: GattStatus, fx: &mut Vec<Effect>) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        if status.requires_bonding() && !link.bond_attempted {
            info!("Device {} requires bonding ({:?})", link.device_id, status);
            link.bond_attempted = true;
            link.watching_bond = true;
            link.unlock_char = None;
            link.notify_char = None;
            fx.push(Effect::CloseSession(link.session));
            fx.push(Effect::CreateBond {
                session: link.session,
                peer: link.peer.clone(),
            });
            self.enter(ScanSession::Reconnecting, fx);
            return;
        }

        if status.requires_bonding() {
            warn!("Still not authorized after bonding, scanning again");
            self.close_link(fx);
            self.begin_scan(fx);
            return;
        }

        warn!("GATT error {:?}, closing session", status);
        self.close_link(fx);
        self.enter(
            ScanSession::Failed {
                reason: status.failure_reason(),
            },
            fx,
        );
        self.begin_scan(fx);
    }

    fn on_services(&mut self, services: &[DiscoveredService], fx: &mut Vec<Effect>) {
        if !matches!(self.state, ScanSession::Connected { .. }) {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let has = |wanted: Uuid| {
            services
                .iter()
                .any(|service| service.characteristics.contains(&wanted))
        };
        if !has(UUID_UNLOCK_WRITE_CHAR) || !has(UUID_UNLOCK_NOTIFY_CHAR) {
            warn!(
                "Device {} does not expose the unlock characteristics",
                link.device_id
            );
            self.close_link(fx);
            self.begin_scan(fx);
            return;
        }

        link.unlock_char = Some(UUID_UNLOCK_WRITE_CHAR);
        link.notify_char = Some(UUID_UNLOCK_NOTIFY_CHAR);
        fx.push(Effect::SetNotify {
            session: link.session,
            characteristic: UUID_UNLOCK_NOTIFY_CHAR,
        });
    }

    fn on_notification(&mut self, characteristic: Uuid, value: Vec<u8>, fx: &mut Vec<Effect>) {
        if !matches!(self.state, ScanSession::Connected { .. }) {
            return;
        }
        let Some(link) = self.link.as_ref() else {
            return;
        };
        if link.notify_char != Some(characteristic) {
            debug!("Ignoring notification from {}", characteristic);
            return;
        }

        let payload = value.get(NOTIFY_HEADER_LEN..).unwrap_or_default().to_vec();
        debug!("Payload from {}: {:02x?}", link.device_id, payload);
        if self.registry.record_payload(&link.device_id, payload) {
            fx.push(Effect::PersistDevices(self.registry.to_vec()));
            fx.push(Effect::DevicesChanged(self.registry.snapshot()));
        }
        fx.push(Effect::ReadSignal(link.session));
    }

    fn on_signal(&mut self, rssi: i16, fx: &mut Vec<Effect>) {
        let ScanSession::Connected { device_id, .. } = self.state else {
            return;
        };
        self.enter(
            ScanSession::Connected {
                device_id,
                signal: Some(rssi),
            },
            fx,
        );

        let Some(link) = self.link.as_mut() else {
            return;
        };
        if link.command_sent {
            debug!("Unlock command already sent this session");
            return;
        }
        let Some(characteristic) = link.unlock_char else {
            return;
        };
        let Some(device) = self.registry.get(&link.device_id) else {
            return;
        };
        if !device.accepts_signal(rssi) {
            debug!(
                "Signal {} dBm below threshold {} dBm, holding the command",
                rssi, device.rssi_threshold
            );
            return;
        }

        match encode(
            self.settings.layout,
            &device.key_material,
            &device.static_code,
            &device.last_payload,
        ) {
            Ok(command) => {
                info!("Writing unlock command to {}", device.service_id);
                link.command_sent = true;
                fx.push(Effect::WriteCommand {
                    session: link.session,
                    characteristic,
                    command,
                });
            }
            Err(e) => {
                error!("Cannot build unlock command for {}: {}", device.service_id, e);
                self.teardown(fx);
                self.enter(
                    ScanSession::Failed {
                        reason: FailureReason::IncorrectConfiguration,
                    },
                    fx,
                );
            }
        }
    }

    fn on_write_issued(&mut self, outcome: WriteOutcome, fx: &mut Vec<Effect>) {
        match outcome {
            WriteOutcome::Issued => debug!("Unlock write issued"),
            WriteOutcome::Busy => {
                warn!("Device busy, dropping the session and scanning again");
                self.close_link(fx);
                self.begin_scan(fx);
            }
            WriteOutcome::Failed => warn!("Unlock write could not be issued"),
        }
    }

    // ── Bonding ───────────────────────────────────────────────

    fn on_bond(&mut self, event: BondEvent, fx: &mut Vec<Effect>) {
        if self.state != ScanSession::Reconnecting {
            debug!("Ignoring bond event {:?} while {}", event, self.state);
            return;
        }
        match event {
            BondEvent::Bonded => {
                let next = self.allocate_session();
                let Some(link) = self.link.as_mut() else {
                    return;
                };
                info!("Bonded with {}, reconnecting (session {})", link.peer, next);
                fx.push(Effect::UnwatchBond(link.session));
                fx.push(Effect::CloseSession(link.session));
                link.session = next;
                link.watching_bond = false;
                fx.push(Effect::Connect {
                    session: next,
                    peer: link.peer.clone(),
                });
                self.enter(ScanSession::Connecting, fx);
            }
            BondEvent::Failed => {
                warn!("Bonding failed, scanning again");
                self.close_link(fx);
                self.begin_scan(fx);
            }
            BondEvent::PermissionDenied => {
                self.teardown(fx);
                self.enter(
                    ScanSession::Failed {
                        reason: FailureReason::NoConnectPermission,
                    },
                    fx,
                );
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────

    fn owns(&self, session: SessionId) -> bool {
        self.link.as_ref().is_some_and(|link| link.session == session)
    }

    fn allocate_session(&mut self) -> SessionId {
        self.next_session += 1;
        SessionId(self.next_session)
    }

    /// Schedules a fresh scan, unless availability already rules it out.
    fn begin_scan(&mut self, fx: &mut Vec<Effect>) {
        if let Some(reason) = self.availability.and_then(|a| a.failure()) {
            self.enter(ScanSession::Failed { reason }, fx);
            return;
        }
        fx.push(Effect::StopScan);
        fx.push(Effect::ScheduleScan(ScanRequest {
            filters: self.registry.scan_filters(),
            settings: self.settings.scan_settings,
        }));
        self.enter(ScanSession::Scanning, fx);
    }

    fn fail_scan(&mut self, reason: FailureReason, fx: &mut Vec<Effect>) {
        fx.push(Effect::StopScan);
        self.enter(ScanSession::Failed { reason }, fx);
    }

    /// Releases the GATT session and bond listener, if any.
    fn close_link(&mut self, fx: &mut Vec<Effect>) {
        if let Some(link) = self.link.take() {
            if link.watching_bond {
                fx.push(Effect::UnwatchBond(link.session));
            }
            fx.push(Effect::CloseSession(link.session));
        }
    }

    /// Cancels everything in flight: scan, connection, bond and cooldown.
    fn teardown(&mut self, fx: &mut Vec<Effect>) {
        self.close_link(fx);
        fx.push(Effect::StopScan);
        if self.cooling_down {
            self.cooling_down = false;
            fx.push(Effect::CancelCooldown);
        }
    }

    fn enter(&mut self, next: ScanSession, fx: &mut Vec<Effect>) {
        if self.state == next {
            return;
        }
        info!("{} -> {}", self.state, next);
        self.state = next.clone();
        fx.push(Effect::Publish(next));
    }
}
