//! Radio and location availability
//! `AvailabilityGate` turns a platform `AvailabilitySource` into a live signal. The
//! platform listener only runs while somebody holds an `AvailabilitySubscription`.

use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::watch;

use crate::core::bluetooth::types::Availability;

/// Platform side of availability reporting.
pub trait AvailabilitySource: Send + Sync {
    /// Current state, read synchronously.
    fn current(&self) -> Availability;
    /// Begin pushing changes into `publisher`.
    fn start_listening(&self, publisher: AvailabilityPublisher);
    fn stop_listening(&self);
}

/// Handed to a source so it can report changes. Identical states are suppressed.
#[derive(Clone)]
pub struct AvailabilityPublisher {
    tx: Arc<watch::Sender<Availability>>,
}

impl AvailabilityPublisher {
    pub fn publish(&self, availability: Availability) {
        self.update(|current| *current = availability);
    }

    pub fn set_radio_enabled(&self, enabled: bool) {
        self.update(|current| current.radio_enabled = enabled);
    }

    pub fn set_location_enabled(&self, enabled: bool) {
        self.update(|current| current.location_enabled = enabled);
    }

    fn update(&self, change: impl FnOnce(&mut Availability)) {
        self.tx.send_if_modified(|current| {
            let before = *current;
            change(current);
            if *current != before {
                debug!("Availability changed: {:?} -> {:?}", before, *current);
                true
            } else {
                false
            }
        });
    }
}

struct GateInner {
    source: Arc<dyn AvailabilitySource>,
    tx: Arc<watch::Sender<Availability>>,
    subscribers: Mutex<usize>,
}

impl GateInner {
    fn release(&self) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *subscribers = subscribers.saturating_sub(1);
        if *subscribers == 0 {
            info!("Last availability subscriber left, stopping listener");
            self.source.stop_listening();
        }
    }
}

/// Shared availability signal with subscriber-counted listener lifecycle
#[derive(Clone)]
pub struct AvailabilityGate {
    inner: Arc<GateInner>,
}

impl AvailabilityGate {
    pub fn new(source: Arc<dyn AvailabilitySource>) -> Self {
        let (tx, _) = watch::channel(source.current());
        Self {
            inner: Arc::new(GateInner {
                source,
                tx: Arc::new(tx),
                subscribers: Mutex::new(0),
            }),
        }
    }

    /// Subscribes to the signal. The first subscriber starts the platform listener and
    /// every subscriber sees the current snapshot first.
    pub fn subscribe(&self) -> AvailabilitySubscription {
        let inner = &self.inner;
        let mut subscribers = match inner.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *subscribers == 0 {
            inner.tx.send_replace(inner.source.current());
            info!("First availability subscriber, starting listener");
            inner.source.start_listening(AvailabilityPublisher {
                tx: inner.tx.clone(),
            });
        }
        *subscribers += 1;

        let mut rx = inner.tx.subscribe();
        rx.mark_changed();
        AvailabilitySubscription {
            rx,
            gate: self.inner.clone(),
        }
    }

    /// Latest known state without subscribing.
    pub fn snapshot(&self) -> Availability {
        *self.inner.tx.borrow()
    }

    pub fn subscriber_count(&self) -> usize {
        match self.inner.subscribers.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// A live view of the availability signal. Dropping it unsubscribes.
pub struct AvailabilitySubscription {
    rx: watch::Receiver<Availability>,
    gate: Arc<GateInner>,
}

impl AvailabilitySubscription {
    /// Waits for the next state. The first call returns the snapshot at subscribe time,
    /// later calls return the latest state after a change. `None` once the gate is gone.
    pub async fn changed(&mut self) -> Option<Availability> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn current(&self) -> Availability {
        *self.rx.borrow()
    }

    /// Reads the current state and marks it seen, so `changed` waits for the next one.
    pub fn take_current(&mut self) -> Availability {
        *self.rx.borrow_and_update()
    }
}

impl Drop for AvailabilitySubscription {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Availability pushed in by the embedding application
#[derive(Default)]
pub struct ManualAvailability {
    state: Mutex<Option<Availability>>,
    publisher: Mutex<Option<AvailabilityPublisher>>,
}

impl ManualAvailability {
    pub fn new(initial: Availability) -> Self {
        Self {
            state: Mutex::new(Some(initial)),
            publisher: Mutex::new(None),
        }
    }

    pub fn set(&self, availability: Availability) {
        if let Ok(mut state) = self.state.lock() {
            *state = Some(availability);
        }
        if let Ok(publisher) = self.publisher.lock() {
            if let Some(publisher) = publisher.as_ref() {
                publisher.publish(availability);
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.publisher
            .lock()
            .map(|publisher| publisher.is_some())
            .unwrap_or(false)
    }
}

impl AvailabilitySource for ManualAvailability {
    fn current(&self) -> Availability {
        self.state
            .lock()
            .ok()
            .and_then(|state| *state)
            .unwrap_or(Availability::ON)
    }

    fn start_listening(&self, publisher: AvailabilityPublisher) {
        if let Ok(mut slot) = self.publisher.lock() {
            *slot = Some(publisher);
        }
    }

    fn stop_listening(&self) {
        if let Ok(mut slot) = self.publisher.lock() {
            *slot = None;
        }
    }
}
