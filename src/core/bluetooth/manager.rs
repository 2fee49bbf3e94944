//! Unlock manager
//! Runs the session state machine on a single Tokio task. Caller commands, platform
//! callbacks, availability changes and timers all arrive through one `tokio::select!`
//! loop, so transitions never race each other. The manager carries out the machine's
//! effects against the platform and publishes every state change.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ScannerConfig;
use crate::core::bluetooth::availability::{AvailabilityGate, AvailabilitySubscription};
use crate::core::bluetooth::events::{BondEvent, Event, GattEvent};
use crate::core::bluetooth::machine::{Effect, MachineSettings, SessionMachine};
use crate::core::bluetooth::platform::{DeviceStore, EventSink, Platform};
use crate::core::bluetooth::rate_limiter::ScanRateLimiter;
use crate::core::bluetooth::types::{
    Availability, GattStatus, ScanRequest, ScanSession, TargetDevice,
};
use crate::error::PlatformError;

const TRANSITION_BUFFER: usize = 64;

#[derive(Debug)]
enum Command {
    Start(Vec<TargetDevice>),
    Stop,
    RestartIfNotBusy,
    Shutdown,
}

/// Caller side of a running manager. Cheap to clone.
#[derive(Clone)]
pub struct ScannerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ScanSession>,
    devices: watch::Receiver<Arc<[TargetDevice]>>,
    transitions: broadcast::Sender<ScanSession>,
}

impl ScannerHandle {
    /// Scans for `devices`. A no-op for an empty list or the set already being scanned.
    pub fn start(&self, devices: Vec<TargetDevice>) -> Result<()> {
        self.send(Command::Start(devices))
    }

    /// Cancels scanning and any open session. The device list is kept.
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Restarts scanning unless a connection attempt is in progress.
    pub fn restart_if_not_busy(&self) -> Result<()> {
        self.send(Command::RestartIfNotBusy)
    }

    /// Stops everything and ends the manager task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub fn state(&self) -> ScanSession {
        self.state.borrow().clone()
    }

    /// Latest-value view of the session state.
    pub fn watch_state(&self) -> watch::Receiver<ScanSession> {
        self.state.clone()
    }

    /// Every transition, in order. Slow receivers may lag.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ScanSession> {
        self.transitions.subscribe()
    }

    /// Read-only snapshot of the device registry.
    pub fn devices(&self) -> Arc<[TargetDevice]> {
        self.devices.borrow().clone()
    }

    pub fn watch_devices(&self) -> watch::Receiver<Arc<[TargetDevice]>> {
        self.devices.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Unlock manager is not running"))
    }
}

pub struct UnlockManager {
    machine: SessionMachine,
    limiter: ScanRateLimiter<ScanRequest>,
    platform: Platform,
    gate: AvailabilityGate,
    store: Option<Arc<dyn DeviceStore>>,
    /// Device lists waiting for the store writer, oldest first
    persist_tx: Option<mpsc::UnboundedSender<Vec<TargetDevice>>>,
    persist_rx: Option<mpsc::UnboundedReceiver<Vec<TargetDevice>>>,
    sink: EventSink,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    availability: Option<AvailabilitySubscription>,
    cooldown_until: Option<Instant>,
    health_restart_at: Option<Instant>,
    health_interval: Option<Duration>,
    state_tx: watch::Sender<ScanSession>,
    devices_tx: watch::Sender<Arc<[TargetDevice]>>,
    transitions_tx: broadcast::Sender<ScanSession>,
}

impl UnlockManager {
    pub fn new(
        platform: Platform,
        gate: AvailabilityGate,
        store: Option<Arc<dyn DeviceStore>>,
        config: &ScannerConfig,
    ) -> (Self, ScannerHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ScanSession::Idle);
        let (devices_tx, devices_rx) = watch::channel::<Arc<[TargetDevice]>>(Arc::from(Vec::new()));
        let (transitions_tx, _) = broadcast::channel(TRANSITION_BUFFER);
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        let handle = ScannerHandle {
            commands: commands_tx,
            state: state_rx,
            devices: devices_rx,
            transitions: transitions_tx.clone(),
        };
        let manager = Self {
            machine: SessionMachine::new(MachineSettings::from(config)),
            limiter: ScanRateLimiter::new(config.scans_per_period, config.scan_period()),
            platform,
            gate,
            store,
            persist_tx: Some(persist_tx),
            persist_rx: Some(persist_rx),
            sink: EventSink::new(events_tx),
            commands,
            events,
            availability: None,
            cooldown_until: None,
            health_restart_at: None,
            health_interval: None,
            state_tx,
            devices_tx,
            transitions_tx,
        };
        (manager, handle)
    }

    /// Builds a manager and runs it on its own task.
    pub fn spawn(
        platform: Platform,
        gate: AvailabilityGate,
        store: Option<Arc<dyn DeviceStore>>,
        config: &ScannerConfig,
    ) -> (ScannerHandle, JoinHandle<()>) {
        let (manager, handle) = Self::new(platform, gate, store, config);
        let task = tokio::spawn(manager.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        info!("Unlock manager started");
        let writer = match (self.store.clone(), self.persist_rx.take()) {
            (Some(store), Some(pending)) => Some(tokio::spawn(write_devices(store, pending))),
            _ => None,
        };
        loop {
            let scan_deadline = self.limiter.next_deadline();
            let cooldown_deadline = self.cooldown_until;
            let health_deadline = self.health_restart_at;

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) => {
                            info!("Unlock manager received shutdown command");
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            info!("All scanner handles dropped, shutting down");
                            break;
                        }
                    }
                }
                Some(event) = self.events.recv() => {
                    self.dispatch(event);
                }
                availability = next_availability(&mut self.availability) => {
                    match availability {
                        Some(availability) => self.dispatch(Event::Availability(availability)),
                        None => {
                            warn!("Availability signal closed");
                            self.availability = None;
                        }
                    }
                }
                _ = sleep_until_some(scan_deadline) => {
                    self.release_scans();
                }
                _ = sleep_until_some(cooldown_deadline) => {
                    self.cooldown_until = None;
                    self.dispatch(Event::CooldownElapsed);
                }
                _ = sleep_until_some(health_deadline) => {
                    self.health_restart_at = self.health_interval.map(|interval| Instant::now() + interval);
                    debug!("Periodic health restart");
                    self.dispatch(Event::HealthRestart);
                }
            }
        }

        self.dispatch(Event::Stop);
        // Closing the queue lets the writer flush what is left and exit.
        self.persist_tx = None;
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Device store writer failed: {}", e);
            }
        }
        info!("Unlock manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        debug!("Handling command {:?}", command);
        let event = match command {
            Command::Start(devices) => Event::Start(devices),
            Command::Stop => Event::Stop,
            Command::RestartIfNotBusy => Event::RestartIfNotBusy,
            Command::Shutdown => return,
        };
        self.dispatch(event);
    }

    /// Feeds `event` through the machine, then any follow-up events the effects produced.
    fn dispatch(&mut self, event: Event) {
        self.drain(VecDeque::from([event]));
    }

    fn drain(&mut self, mut queue: VecDeque<Event>) {
        while let Some(event) = queue.pop_front() {
            for effect in self.machine.handle(event) {
                self.apply(effect, &mut queue);
            }
        }
    }

    fn apply(&mut self, effect: Effect, queue: &mut VecDeque<Event>) {
        match effect {
            Effect::Publish(state) => {
                self.state_tx.send_replace(state.clone());
                // No receivers is fine.
                let _ = self.transitions_tx.send(state);
            }
            Effect::DevicesChanged(snapshot) => {
                self.devices_tx.send_replace(snapshot);
            }
            Effect::PersistDevices(devices) => self.persist(devices),
            Effect::WatchAvailability => {
                let mut subscription = self.gate.subscribe();
                queue.push_back(Event::Availability(subscription.take_current()));
                self.availability = Some(subscription);
            }
            Effect::UnwatchAvailability => {
                self.availability = None;
            }
            Effect::ScheduleScan(request) => {
                let ready = self.limiter.schedule(request, Instant::now());
                if ready.is_empty() {
                    info!(
                        "Scan quota exhausted, {} scan start(s) waiting",
                        self.limiter.pending_len()
                    );
                }
                for request in ready {
                    self.issue_scan(request, queue);
                }
            }
            Effect::StopScan => {
                self.platform.scanner.stop_scan();
                self.limiter.cancel_pending();
            }
            Effect::Connect { session, peer } => {
                if let Err(e) = self
                    .platform
                    .connection
                    .connect(session, &peer, self.sink.clone())
                {
                    warn!("Connect to {} failed to start: {}", peer, e);
                    queue.push_back(Event::Gatt {
                        session,
                        event: gatt_failure(e),
                    });
                }
            }
            Effect::DiscoverServices(session) => {
                if let Err(e) = self.platform.connection.discover_services(session) {
                    warn!("Service discovery failed to start: {}", e);
                    let event = match e {
                        PlatformError::PermissionDenied(permission) => {
                            GattEvent::PermissionDenied(permission)
                        }
                        _ => GattEvent::DiscoveryFailed,
                    };
                    queue.push_back(Event::Gatt { session, event });
                }
            }
            Effect::SetNotify {
                session,
                characteristic,
            } => {
                if let Err(e) = self
                    .platform
                    .connection
                    .set_notify(session, characteristic, true)
                {
                    warn!("Subscribing to {} failed: {}", characteristic, e);
                    queue.push_back(Event::Gatt {
                        session,
                        event: gatt_failure(e),
                    });
                }
            }
            Effect::ReadSignal(session) => {
                if let Err(e) = self.platform.connection.read_remote_signal(session) {
                    warn!("Signal read failed to start: {}", e);
                    queue.push_back(Event::Gatt {
                        session,
                        event: gatt_failure(e),
                    });
                }
            }
            Effect::WriteCommand {
                session,
                characteristic,
                command,
            } => {
                let outcome = self.platform.connection.write_characteristic(
                    session,
                    characteristic,
                    command.as_bytes(),
                );
                queue.push_back(Event::Gatt {
                    session,
                    event: GattEvent::WriteIssued(outcome),
                });
            }
            Effect::CreateBond { session, peer } => {
                let event = match self
                    .platform
                    .bonds
                    .create_bond(session, &peer, self.sink.clone())
                {
                    Ok(true) => None,
                    Ok(false) => Some(BondEvent::Failed),
                    Err(PlatformError::PermissionDenied(_)) => Some(BondEvent::PermissionDenied),
                    Err(e) => {
                        warn!("Bonding with {} failed to start: {}", peer, e);
                        Some(BondEvent::Failed)
                    }
                };
                if let Some(event) = event {
                    queue.push_back(Event::Bond { session, event });
                }
            }
            Effect::WatchBond { session, peer } => {
                self.platform
                    .bonds
                    .watch_bond(session, &peer, self.sink.clone());
            }
            Effect::UnwatchBond(session) => self.platform.bonds.unwatch(session),
            Effect::CloseSession(session) => self.platform.connection.close(session),
            Effect::StartCooldown(duration) => {
                self.cooldown_until = Some(Instant::now() + duration);
            }
            Effect::CancelCooldown => self.cooldown_until = None,
            Effect::ArmHealthRestart(interval) => {
                self.health_interval = Some(interval);
                self.health_restart_at = Some(Instant::now() + interval);
            }
            Effect::DisarmHealthRestart => {
                self.health_interval = None;
                self.health_restart_at = None;
            }
        }
    }

    fn issue_scan(&mut self, request: ScanRequest, queue: &mut VecDeque<Event>) {
        debug!("Starting scan with {} filter(s)", request.filters.len());
        if let Err(e) = self.platform.scanner.start_scan(&request, self.sink.clone()) {
            warn!("Scan start refused: {}", e);
            queue.push_back(Event::ScanRejected(e));
        }
    }

    fn release_scans(&mut self) {
        let mut queue = VecDeque::new();
        for request in self.limiter.release(Instant::now()) {
            self.issue_scan(request, &mut queue);
        }
        self.drain(queue);
    }

    fn persist(&self, devices: Vec<TargetDevice>) {
        if self.store.is_none() {
            return;
        }
        if let Some(tx) = &self.persist_tx {
            if tx.send(devices).is_err() {
                warn!("Device store writer is gone, update not saved");
            }
        }
    }
}

/// Saves device lists one at a time. A backlog collapses to its newest entry.
async fn write_devices(
    store: Arc<dyn DeviceStore>,
    mut pending: mpsc::UnboundedReceiver<Vec<TargetDevice>>,
) {
    while let Some(mut devices) = pending.recv().await {
        while let Ok(newer) = pending.try_recv() {
            devices = newer;
        }
        if let Err(e) = store.save(&devices).await {
            error!("Failed to persist devices: {}", e);
        }
    }
    debug!("Device store writer finished");
}

fn gatt_failure(err: PlatformError) -> GattEvent {
    match err {
        PlatformError::PermissionDenied(permission) => GattEvent::PermissionDenied(permission),
        _ => GattEvent::Error(GattStatus::Other(-1)),
    }
}

async fn next_availability(
    subscription: &mut Option<AvailabilitySubscription>,
) -> Option<Availability> {
    match subscription {
        Some(subscription) => subscription.changed().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
