//! Platform capability interface
//! The state machine never touches the radio itself. It drives these traits, and the
//! platform reports back asynchronously through an `EventSink`.
//!
//! Calls are fire-and-forget: a method returning `Ok` only means the operation was
//! started. Its result arrives later as an event tagged with the session it belongs to.

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::events::{BondEvent, Event, GattEvent};
use crate::core::bluetooth::types::{
    Advertisement, PeerId, ScanFailure, ScanRequest, SessionId, TargetDevice, WriteOutcome,
};
use crate::error::{PlatformError, StoreError};

pub trait PlatformScanner: Send {
    /// Starts a filtered scan. Results and failures go to `sink`.
    fn start_scan(&mut self, request: &ScanRequest, sink: EventSink) -> Result<(), PlatformError>;
    fn stop_scan(&mut self);
}

pub trait PlatformConnection: Send {
    /// Opens a GATT session to `peer`, owned by `session` until `close`.
    fn connect(
        &mut self,
        session: SessionId,
        peer: &PeerId,
        sink: EventSink,
    ) -> Result<(), PlatformError>;
    fn discover_services(&mut self, session: SessionId) -> Result<(), PlatformError>;
    fn read_remote_signal(&mut self, session: SessionId) -> Result<(), PlatformError>;
    fn write_characteristic(
        &mut self,
        session: SessionId,
        characteristic: Uuid,
        value: &[u8],
    ) -> WriteOutcome;
    fn set_notify(
        &mut self,
        session: SessionId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), PlatformError>;
    /// Releases the session. Safe to call for unknown or already closed sessions.
    fn close(&mut self, session: SessionId);
}

pub trait BondManager: Send {
    /// Starts pairing with `peer`. Returns whether the platform accepted the request;
    /// the outcome arrives as a bond event for `session`.
    fn create_bond(
        &mut self,
        session: SessionId,
        peer: &PeerId,
        sink: EventSink,
    ) -> Result<bool, PlatformError>;
    /// Reports bond changes of a peer that is already pairing.
    fn watch_bond(&mut self, session: SessionId, peer: &PeerId, sink: EventSink);
    fn unwatch(&mut self, session: SessionId);
}

/// The radio side of the client
pub struct Platform {
    pub scanner: Box<dyn PlatformScanner>,
    pub connection: Box<dyn PlatformConnection>,
    pub bonds: Box<dyn BondManager>,
}

/// Persistence for the device registry
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn load(&self) -> Result<Vec<TargetDevice>, StoreError>;
    async fn save(&self, devices: &[TargetDevice]) -> Result<(), StoreError>;
}

/// Where platform callbacks are delivered. Cloned into every platform task.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn scan_result(&self, advertisement: Advertisement) {
        self.send(Event::ScanResult(advertisement));
    }

    pub fn scan_failed(&self, failure: ScanFailure) {
        self.send(Event::ScanFailed(failure));
    }

    pub fn scan_permission_denied(&self) {
        self.send(Event::ScanPermissionDenied);
    }

    pub fn gatt(&self, session: SessionId, event: GattEvent) {
        self.send(Event::Gatt { session, event });
    }

    pub fn bond(&self, session: SessionId, event: BondEvent) {
        self.send(Event::Bond { session, event });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("Event loop is gone, dropping platform callback");
        }
    }
}
