//! GATT sessions and bonding on top of bluest
//! Every call starts a background task and returns at once. Results are delivered to
//! the state machine through the session's `EventSink`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluest::error::{AttError, ErrorKind};
use bluest::{Adapter, Characteristic, Device, Uuid};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::events::{BondEvent, GattEvent};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::platform::{BondManager, EventSink, PlatformConnection};
use crate::core::bluetooth::scanner::DeviceCache;
use crate::core::bluetooth::types::{
    DiscoveredService, GattStatus, PeerId, SessionId, WriteOutcome,
};
use crate::error::{Permission, PlatformError};

const BOND_POLL_INTERVAL: Duration = Duration::from_secs(1);
const BOND_POLL_ATTEMPTS: u32 = 30;

/// Maps a bluest failure onto the GATT callback the state machine understands.
pub fn gatt_event_for(err: &bluest::Error) -> GattEvent {
    match err.kind() {
        ErrorKind::Protocol(att) if att == AttError::INSUFFICIENT_AUTHENTICATION => {
            GattEvent::Error(GattStatus::InsufficientAuthentication)
        }
        ErrorKind::Protocol(att) if att == AttError::INSUFFICIENT_ENCRYPTION => {
            GattEvent::Error(GattStatus::InsufficientEncryption)
        }
        ErrorKind::Protocol(att) if att == AttError::INSUFFICIENT_AUTHORIZATION => {
            GattEvent::Error(GattStatus::InsufficientAuthorization)
        }
        ErrorKind::NotAuthorized => GattEvent::PermissionDenied(Permission::Connect),
        ErrorKind::Timeout => GattEvent::Error(GattStatus::ConnectionTimeout),
        ErrorKind::NotConnected => GattEvent::Disconnected,
        _ => GattEvent::Error(GattStatus::Other(-1)),
    }
}

fn lookup_device(devices: &DeviceCache, peer: &PeerId) -> Option<Device> {
    devices.lock().ok()?.get(&peer.0).cloned()
}

/// Runs `work` until it finishes or the session is cancelled.
fn spawn_session_task<F>(cancel_token: CancellationToken, work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = work => {}
            _ = cancel_token.cancelled() => {}
        }
    });
}

struct Session {
    device: Device,
    sink: EventSink,
    cancel_token: CancellationToken,
    notify_token: Option<CancellationToken>,
    characteristics: Arc<Mutex<HashMap<Uuid, Characteristic>>>,
    write_in_flight: Arc<AtomicBool>,
}

/// Connection manager for lock sessions
pub struct BluestConnection {
    adapter: Adapter,
    devices: DeviceCache,
    sessions: HashMap<SessionId, Session>,
}

impl BluestConnection {
    pub fn new(adapter: Adapter, devices: DeviceCache) -> Self {
        Self {
            adapter,
            devices,
            sessions: HashMap::new(),
        }
    }

    fn session(&self, session: SessionId) -> Result<&Session, PlatformError> {
        self.sessions
            .get(&session)
            .ok_or(PlatformError::UnknownSession(session.0))
    }
}

impl PlatformConnection for BluestConnection {
    fn connect(
        &mut self,
        session: SessionId,
        peer: &PeerId,
        sink: EventSink,
    ) -> Result<(), PlatformError> {
        let device = lookup_device(&self.devices, peer)
            .ok_or_else(|| PlatformError::Operation(format!("peer {} was not scanned", peer)))?;
        let cancel_token = CancellationToken::new();

        let adapter = self.adapter.clone();
        let task_device = device.clone();
        let task_sink = sink.clone();
        spawn_session_task(cancel_token.clone(), async move {
            let id = task_device.id().to_string();
            if !task_device.is_connected().await {
                info!("Initiating connection to {}...", id);
                if let Err(e) = adapter.connect_device(&task_device).await {
                    warn!("Connection to {} failed: {}", id, e);
                    task_sink.gatt(session, gatt_event_for(&e));
                    return;
                }
            }
            info!("Successfully connected to device {}", id);
            task_sink.gatt(session, GattEvent::Connected { bonding: false });
        });

        self.sessions.insert(
            session,
            Session {
                device,
                sink,
                cancel_token,
                notify_token: None,
                characteristics: Arc::new(Mutex::new(HashMap::new())),
                write_in_flight: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(())
    }

    fn discover_services(&mut self, session: SessionId) -> Result<(), PlatformError> {
        let entry = self.session(session)?;
        let device = entry.device.clone();
        let sink = entry.sink.clone();
        let characteristics = entry.characteristics.clone();

        spawn_session_task(entry.cancel_token.clone(), async move {
            info!("Connection successful, discovering services...");
            let services = match device.discover_services().await {
                Ok(services) => services,
                Err(e) => {
                    error!("Service discovery failed: {}", e);
                    sink.gatt(session, GattEvent::DiscoveryFailed);
                    return;
                }
            };

            let mut discovered = Vec::with_capacity(services.len());
            for service in services {
                let chars = match service.discover_characteristics().await {
                    Ok(chars) => chars,
                    Err(e) => {
                        warn!("Could not list characteristics of {}: {}", service.uuid(), e);
                        continue;
                    }
                };
                let mut uuids = Vec::with_capacity(chars.len());
                if let Ok(mut known) = characteristics.lock() {
                    for char in chars {
                        uuids.push(char.uuid());
                        known.insert(char.uuid(), char);
                    }
                }
                debug!("Service {} exposes {:?}", service.uuid(), uuids);
                discovered.push(DiscoveredService {
                    uuid: service.uuid(),
                    characteristics: uuids,
                });
            }
            sink.gatt(session, GattEvent::ServicesDiscovered(discovered));
        });
        Ok(())
    }

    fn read_remote_signal(&mut self, session: SessionId) -> Result<(), PlatformError> {
        let entry = self.session(session)?;
        let device = entry.device.clone();
        let sink = entry.sink.clone();

        spawn_session_task(entry.cancel_token.clone(), async move {
            match device.rssi().await {
                Ok(rssi) => sink.gatt(session, GattEvent::SignalRead(rssi)),
                Err(e) => debug!("RSSI read failed for session {}: {}", session, e),
            }
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        session: SessionId,
        characteristic: Uuid,
        value: &[u8],
    ) -> WriteOutcome {
        let Ok(entry) = self.session(session) else {
            return WriteOutcome::Failed;
        };
        let Some(char) = entry
            .characteristics
            .lock()
            .ok()
            .and_then(|known| known.get(&characteristic).cloned())
        else {
            warn!("Write characteristic not found: {}", characteristic);
            return WriteOutcome::Failed;
        };
        if entry.write_in_flight.swap(true, Ordering::AcqRel) {
            return WriteOutcome::Busy;
        }

        let in_flight = entry.write_in_flight.clone();
        let sink = entry.sink.clone();
        let data = value.to_vec();
        spawn_session_task(entry.cancel_token.clone(), async move {
            debug!("Writing {} byte(s) to {}", data.len(), characteristic);
            let success = match char.write(&data).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Write to {} failed: {}", characteristic, e);
                    false
                }
            };
            in_flight.store(false, Ordering::Release);
            sink.gatt(session, GattEvent::WriteCompleted { success });
        });
        WriteOutcome::Issued
    }

    fn set_notify(
        &mut self,
        session: SessionId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), PlatformError> {
        let entry = self
            .sessions
            .get_mut(&session)
            .ok_or(PlatformError::UnknownSession(session.0))?;
        if let Some(token) = entry.notify_token.take() {
            token.cancel();
        }
        if !enabled {
            return Ok(());
        }

        let char = entry
            .characteristics
            .lock()
            .ok()
            .and_then(|known| known.get(&characteristic).cloned())
            .ok_or_else(|| {
                PlatformError::Operation(format!(
                    "notification characteristic not found: {}",
                    characteristic
                ))
            })?;
        let token = entry.cancel_token.child_token();
        NotificationHandler::new(session, entry.sink.clone(), token.clone())
            .setup_notifications(char);
        entry.notify_token = Some(token);
        Ok(())
    }

    fn close(&mut self, session: SessionId) {
        let Some(entry) = self.sessions.remove(&session) else {
            return;
        };
        entry.cancel_token.cancel();

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            let device = entry.device;
            if device.is_connected().await {
                info!("Disconnecting from device {}", device.id());
                match adapter.disconnect_device(&device).await {
                    Ok(()) => info!("Successfully disconnected"),
                    Err(e) => warn!("Disconnect from {} failed: {}", device.id(), e),
                }
            } else {
                debug!("Device {} not connected", device.id());
            }
        });
    }
}

/// Pairing through the operating system's bonding flow
pub struct BluestBondManager {
    devices: DeviceCache,
    watchers: HashMap<SessionId, CancellationToken>,
}

impl BluestBondManager {
    pub fn new(devices: DeviceCache) -> Self {
        Self {
            devices,
            watchers: HashMap::new(),
        }
    }

    fn watcher(&mut self, session: SessionId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.watchers.insert(session, token.clone()) {
            previous.cancel();
        }
        token
    }
}

impl BondManager for BluestBondManager {
    fn create_bond(
        &mut self,
        session: SessionId,
        peer: &PeerId,
        sink: EventSink,
    ) -> Result<bool, PlatformError> {
        let Some(device) = lookup_device(&self.devices, peer) else {
            warn!("Cannot bond with unknown peer {}", peer);
            return Ok(false);
        };
        let token = self.watcher(session);
        spawn_session_task(token, async move {
            info!("Pairing with {}...", device.id());
            let event = match device.pair().await {
                Ok(()) => BondEvent::Bonded,
                Err(e) if e.kind() == ErrorKind::NotAuthorized => BondEvent::PermissionDenied,
                Err(e) => {
                    warn!("Pairing with {} failed: {}", device.id(), e);
                    BondEvent::Failed
                }
            };
            sink.bond(session, event);
        });
        Ok(true)
    }

    fn watch_bond(&mut self, session: SessionId, peer: &PeerId, sink: EventSink) {
        let Some(device) = lookup_device(&self.devices, peer) else {
            sink.bond(session, BondEvent::Failed);
            return;
        };
        let token = self.watcher(session);
        spawn_session_task(token, async move {
            let mut interval = tokio::time::interval(BOND_POLL_INTERVAL);
            for _ in 0..BOND_POLL_ATTEMPTS {
                interval.tick().await;
                if matches!(device.is_paired().await, Ok(true)) {
                    sink.bond(session, BondEvent::Bonded);
                    return;
                }
            }
            warn!("Bonding with {} did not finish in time", device.id());
            sink.bond(session, BondEvent::Failed);
        });
    }

    fn unwatch(&mut self, session: SessionId) {
        if let Some(token) = self.watchers.remove(&session) {
            token.cancel();
        }
    }
}
