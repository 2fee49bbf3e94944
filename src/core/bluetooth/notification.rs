//! Notification handling for an open session
//! Values pushed by the lock come back to the state machine as `Notification`
//! events. The stream ending means the link went away.

use bluest::Characteristic;
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::connection::gatt_event_for;
use crate::core::bluetooth::events::GattEvent;
use crate::core::bluetooth::platform::EventSink;
use crate::core::bluetooth::types::SessionId;

pub struct NotificationHandler {
    session: SessionId,
    sink: EventSink,
    cancel_token: CancellationToken,
}

impl NotificationHandler {
    pub fn new(session: SessionId, sink: EventSink, cancel_token: CancellationToken) -> Self {
        Self {
            session,
            sink,
            cancel_token,
        }
    }

    /// Subscribes to `notify_char` on a background task.
    pub fn setup_notifications(self, notify_char: Characteristic) {
        info!("Subscribing to notifications for session {}...", self.session);
        tokio::spawn(async move {
            self.process_notifications(notify_char).await;
        });
    }

    async fn process_notifications(self, notify_char: Characteristic) {
        let uuid = notify_char.uuid();
        let mut notification_stream = match notify_char.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                self.sink.gatt(self.session, gatt_event_for(&e));
                return;
            }
        };

        loop {
            tokio::select! {
                result = notification_stream.next() => match result {
                    Some(Ok(value)) => {
                        debug!("Received notification on {}: {:02x?}", uuid, value);
                        self.sink.gatt(
                            self.session,
                            GattEvent::Notification { characteristic: uuid, value },
                        );
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        self.sink.gatt(self.session, gatt_event_for(&e));
                        break;
                    }
                    None => {
                        info!("Notification stream ended for session {}", self.session);
                        self.sink.gatt(self.session, GattEvent::Disconnected);
                        break;
                    }
                },
                _ = self.cancel_token.cancelled() => {
                    debug!("Notifications for session {} cancelled", self.session);
                    break;
                }
            }
        }
    }
}
