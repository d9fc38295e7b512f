//! NotificationBus: fan-out of connection-status and inbound-message events
//! to the hosting application.
//!
//! Two streams are offered for each kind of notification:
//!
//! - a **broadcast** stream (`subscribe_*`): every event, exactly once, to
//!   every subscriber that existed when it was published.  Late subscribers
//!   miss history.
//! - a **watch** cell (`watch_*` / `latest_*`): only the most recent event,
//!   starting at `None`.  Useful for a UI that just shows "last seen".
//!
//! Publishing never blocks and never fails, even with zero subscribers.

use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::domain::{ConnectionStatus, InboundEvent, ReceivedMessage};

/// Per-subscriber backlog before a slow receiver starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Status and message fan-out with a last-value cache.
#[derive(Debug)]
pub struct NotificationBus {
    status_tx: broadcast::Sender<ConnectionStatus>,
    message_tx: broadcast::Sender<ReceivedMessage>,
    latest_status: watch::Sender<Option<ConnectionStatus>>,
    latest_message: watch::Sender<Option<ReceivedMessage>>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (status_tx, _) = broadcast::channel(capacity);
        let (message_tx, _) = broadcast::channel(capacity);
        let (latest_status, _) = watch::channel(None);
        let (latest_message, _) = watch::channel(None);
        Self {
            status_tx,
            message_tx,
            latest_status,
            latest_message,
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.message_tx.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<Option<ConnectionStatus>> {
        self.latest_status.subscribe()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Option<ReceivedMessage>> {
        self.latest_message.subscribe()
    }

    /// Most recent status, `None` until the first connect/disconnect.
    pub fn latest_status(&self) -> Option<ConnectionStatus> {
        self.latest_status.borrow().clone()
    }

    /// Most recent message, `None` until the first one arrives.
    pub fn latest_message(&self) -> Option<ReceivedMessage> {
        self.latest_message.borrow().clone()
    }

    /// Projects `event` onto the status or message stream.
    ///
    /// Binary payloads that are not valid UTF-8 produce no message
    /// notification; they remain visible on the engine's raw event stream.
    pub fn publish(&self, event: &InboundEvent) {
        if let Some(status) = event.status() {
            trace!(session = %status.session_id, is_connect = status.is_connect, "status");
            self.latest_status.send_replace(Some(status.clone()));
            // An error only means nobody is subscribed right now.
            let _ = self.status_tx.send(status);
        } else if let Some(message) = event.message() {
            trace!(session = %message.session_id, len = message.content.len(), "message");
            self.latest_message.send_replace(Some(message.clone()));
            let _ = self.message_tx.send(message);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
