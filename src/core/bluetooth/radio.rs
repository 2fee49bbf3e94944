//! Radio availability from the host adapter
//! Desktop stacks have no location switch, so location is always reported as on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bluest::{Adapter, AdapterEvent};
use futures_util::StreamExt;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::availability::{AvailabilityPublisher, AvailabilitySource};
use crate::core::bluetooth::types::Availability;

pub struct BluestAvailability {
    adapter: Adapter,
    radio_enabled: Arc<AtomicBool>,
    listener: Mutex<Option<CancellationToken>>,
}

impl BluestAvailability {
    pub fn new(adapter: Adapter, radio_enabled: bool) -> Self {
        Self {
            adapter,
            radio_enabled: Arc::new(AtomicBool::new(radio_enabled)),
            listener: Mutex::new(None),
        }
    }
}

impl AvailabilitySource for BluestAvailability {
    fn current(&self) -> Availability {
        Availability::new(self.radio_enabled.load(Ordering::Acquire), true)
    }

    fn start_listening(&self, publisher: AvailabilityPublisher) {
        let token = CancellationToken::new();
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(previous) = listener.replace(token.clone()) {
                previous.cancel();
            }
        }

        let adapter = self.adapter.clone();
        let radio_enabled = self.radio_enabled.clone();
        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to listen for adapter events: {}", e);
                    return;
                }
            };
            info!("Listening for adapter state changes");
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(AdapterEvent::Available)) => {
                            radio_enabled.store(true, Ordering::Release);
                            publisher.set_radio_enabled(true);
                        }
                        Some(Ok(AdapterEvent::Unavailable)) => {
                            radio_enabled.store(false, Ordering::Release);
                            publisher.set_radio_enabled(false);
                        }
                        Some(Err(e)) => warn!("Adapter event error: {}", e),
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            info!("Adapter event listener stopped");
        });
    }

    fn stop_listening(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(token) = listener.take() {
                token.cancel();
            }
        }
    }
}
