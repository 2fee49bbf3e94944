//! Mock radio for integration tests.
//!
//! Records every platform call so tests can assert on the full command
//! history, and keeps the manager's event sink so tests can play the
//! part of the Bluetooth stack.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use proximity_unlock::config::ScannerConfig;
use proximity_unlock::core::bluetooth::{
    Advertisement, Availability, AvailabilityGate, BondEvent, BondManager, DeviceStore, EventSink,
    GattEvent, ManualAvailability, PeerId, Platform, PlatformConnection, PlatformScanner,
    ScanRequest, ScanSession, ScannerHandle, SessionId, TargetDevice, UnlockManager, WriteOutcome,
};
use proximity_unlock::error::PlatformError;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ── Platform call record ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartScan(ScanRequest),
    StopScan,
    Connect(SessionId, PeerId),
    DiscoverServices(SessionId),
    ReadSignal(SessionId),
    Write(SessionId, Uuid, Vec<u8>),
    SetNotify(SessionId, Uuid, bool),
    Close(SessionId),
    CreateBond(SessionId, PeerId),
    WatchBond(SessionId, PeerId),
    Unwatch(SessionId),
}

#[derive(Default)]
struct Shared {
    calls: Vec<Call>,
    sink: Option<EventSink>,
    scan_error: Option<PlatformError>,
    signal_error: Option<PlatformError>,
    write_outcome: Option<WriteOutcome>,
}

// ── MockRadio ─────────────────────────────────────────────────

/// Test-side view of the mock platform.
#[derive(Clone, Default)]
pub struct MockRadio {
    shared: Arc<Mutex<Shared>>,
}

#[allow(dead_code)]
impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn platform(&self) -> Platform {
        Platform {
            scanner: Box::new(MockScanner(self.clone())),
            connection: Box::new(MockConnection(self.clone())),
            bonds: Box::new(MockBonds(self.clone())),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.lock().unwrap().calls.clone()
    }

    pub fn clear(&self) {
        self.shared.lock().unwrap().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn scan_starts(&self) -> usize {
        self.count(|c| matches!(c, Call::StartScan(_)))
    }

    pub fn last_scan(&self) -> Option<ScanRequest> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::StartScan(request) => Some(request),
            _ => None,
        })
    }

    /// Session of the most recent connect.
    pub fn last_session(&self) -> Option<SessionId> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Connect(session, _) => Some(session),
            _ => None,
        })
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Write(_, _, value) => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn was_closed(&self, session: SessionId) -> bool {
        self.calls().contains(&Call::Close(session))
    }

    pub fn fail_next_scan(&self, err: PlatformError) {
        self.shared.lock().unwrap().scan_error = Some(err);
    }

    pub fn fail_next_signal_read(&self, err: PlatformError) {
        self.shared.lock().unwrap().signal_error = Some(err);
    }

    pub fn set_write_outcome(&self, outcome: WriteOutcome) {
        self.shared.lock().unwrap().write_outcome = Some(outcome);
    }

    fn sink(&self) -> EventSink {
        self.shared
            .lock()
            .unwrap()
            .sink
            .clone()
            .expect("manager has not handed out a sink yet")
    }

    // ── Playing the Bluetooth stack ──

    pub fn advertise(&self, peer: &str, service_id: Uuid, rssi: i16) {
        self.sink().scan_result(Advertisement {
            peer: PeerId(peer.to_string()),
            service_ids: vec![service_id],
            rssi,
        });
    }

    pub fn gatt(&self, session: SessionId, event: GattEvent) {
        self.sink().gatt(session, event);
    }

    pub fn bond(&self, session: SessionId, event: BondEvent) {
        self.sink().bond(session, event);
    }

    pub fn scan_failed(&self, failure: proximity_unlock::core::bluetooth::ScanFailure) {
        self.sink().scan_failed(failure);
    }

    fn record(&self, call: Call) {
        self.shared.lock().unwrap().calls.push(call);
    }

    fn keep_sink(&self, sink: EventSink) {
        self.shared.lock().unwrap().sink = Some(sink);
    }
}

struct MockScanner(MockRadio);

impl PlatformScanner for MockScanner {
    fn start_scan(&mut self, request: &ScanRequest, sink: EventSink) -> Result<(), PlatformError> {
        self.0.keep_sink(sink);
        self.0.record(Call::StartScan(request.clone()));
        match self.0.shared.lock().unwrap().scan_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stop_scan(&mut self) {
        self.0.record(Call::StopScan);
    }
}

struct MockConnection(MockRadio);

impl PlatformConnection for MockConnection {
    fn connect(
        &mut self,
        session: SessionId,
        peer: &PeerId,
        sink: EventSink,
    ) -> Result<(), PlatformError> {
        self.0.keep_sink(sink);
        self.0.record(Call::Connect(session, peer.clone()));
        Ok(())
    }

    fn discover_services(&mut self, session: SessionId) -> Result<(), PlatformError> {
        self.0.record(Call::DiscoverServices(session));
        Ok(())
    }

    fn read_remote_signal(&mut self, session: SessionId) -> Result<(), PlatformError> {
        self.0.record(Call::ReadSignal(session));
        match self.0.shared.lock().unwrap().signal_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write_characteristic(
        &mut self,
        session: SessionId,
        characteristic: Uuid,
        value: &[u8],
    ) -> WriteOutcome {
        self.0
            .record(Call::Write(session, characteristic, value.to_vec()));
        self.0
            .shared
            .lock()
            .unwrap()
            .write_outcome
            .unwrap_or(WriteOutcome::Issued)
    }

    fn set_notify(
        &mut self,
        session: SessionId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), PlatformError> {
        self.0
            .record(Call::SetNotify(session, characteristic, enabled));
        Ok(())
    }

    fn close(&mut self, session: SessionId) {
        self.0.record(Call::Close(session));
    }
}

struct MockBonds(MockRadio);

impl BondManager for MockBonds {
    fn create_bond(
        &mut self,
        session: SessionId,
        peer: &PeerId,
        sink: EventSink,
    ) -> Result<bool, PlatformError> {
        self.0.keep_sink(sink);
        self.0.record(Call::CreateBond(session, peer.clone()));
        Ok(true)
    }

    fn watch_bond(&mut self, session: SessionId, peer: &PeerId, sink: EventSink) {
        self.0.keep_sink(sink);
        self.0.record(Call::WatchBond(session, peer.clone()));
    }

    fn unwatch(&mut self, session: SessionId) {
        self.0.record(Call::Unwatch(session));
    }
}

// ── In-memory store ───────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    pub saved: Mutex<Vec<Vec<TargetDevice>>>,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn last_saved(&self) -> Option<Vec<TargetDevice>> {
        self.saved.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl DeviceStore for MemoryStore {
    async fn load(&self) -> Result<Vec<TargetDevice>, proximity_unlock::error::StoreError> {
        Ok(self.last_saved().unwrap_or_default())
    }

    async fn save(&self, devices: &[TargetDevice]) -> Result<(), proximity_unlock::error::StoreError> {
        self.saved.lock().unwrap().push(devices.to_vec());
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────

pub const KEY: &str = "g2769202";
pub const STATIC_CODE: &str = "pcjhp6060px38f9b";

pub fn lock(n: u128, threshold: i16) -> TargetDevice {
    TargetDevice::new(Uuid::from_u128(n), threshold, KEY, STATIC_CODE)
}

pub struct Harness {
    pub radio: MockRadio,
    pub availability: Arc<ManualAvailability>,
    pub gate: AvailabilityGate,
    pub store: Arc<MemoryStore>,
    pub handle: ScannerHandle,
    pub task: JoinHandle<()>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(ScannerConfig::default())
    }

    pub fn with_config(config: ScannerConfig) -> Self {
        let store = Arc::new(MemoryStore::default());
        Self::build(config, store.clone(), store)
    }

    /// Persists through `persisted` instead; `store` then stays empty.
    pub fn with_store(persisted: Arc<dyn DeviceStore>) -> Self {
        Self::build(
            ScannerConfig::default(),
            Arc::new(MemoryStore::default()),
            persisted,
        )
    }

    fn build(
        config: ScannerConfig,
        store: Arc<MemoryStore>,
        persisted: Arc<dyn DeviceStore>,
    ) -> Self {
        let radio = MockRadio::new();
        let availability = Arc::new(ManualAvailability::new(Availability::ON));
        let gate = AvailabilityGate::new(availability.clone());
        let (handle, task) =
            UnlockManager::spawn(radio.platform(), gate.clone(), Some(persisted), &config);
        Self {
            radio,
            availability,
            gate,
            store,
            handle,
            task,
        }
    }

    pub fn state(&self) -> ScanSession {
        self.handle.state()
    }

    /// Waits until the published state satisfies `pred`.
    pub async fn wait_for(&self, pred: impl FnMut(&ScanSession) -> bool) -> ScanSession {
        let mut rx = self.handle.watch_state();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("state never reached")
            .expect("manager stopped");
        state.clone()
    }

    /// Starts scanning for `devices` and waits for the first scan start.
    pub async fn start(&self, devices: Vec<TargetDevice>) {
        self.handle.start(devices).unwrap();
        self.wait_for(|s| *s == ScanSession::Scanning).await;
        settle().await;
    }

    /// Drives a session up to `Connected` with the unlock characteristics discovered.
    pub async fn connect(&self, peer: &str, device: &TargetDevice, rssi: i16) -> SessionId {
        self.radio.advertise(peer, device.service_id, rssi);
        self.wait_for(|s| *s == ScanSession::Connecting).await;
        let session = self.radio.last_session().expect("no connect issued");
        self.radio.gatt(session, GattEvent::Connected { bonding: false });
        self.wait_for(|s| matches!(s, ScanSession::Connected { .. })).await;
        self.radio.gatt(session, unlock_services());
        settle().await;
        session
    }
}

pub fn unlock_services() -> GattEvent {
    use proximity_unlock::core::bluetooth::{
        DiscoveredService, UUID_UNLOCK_NOTIFY_CHAR, UUID_UNLOCK_WRITE_CHAR,
    };
    GattEvent::ServicesDiscovered(vec![DiscoveredService {
        uuid: Uuid::from_u128(0xf400),
        characteristics: vec![UUID_UNLOCK_WRITE_CHAR, UUID_UNLOCK_NOTIFY_CHAR],
    }])
}

/// Lets the manager task drain everything that is queued.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
