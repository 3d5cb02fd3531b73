//! Session event system.
//!
//! The session broadcasts connection lifecycle changes so that callers can
//! log, display or persist them without polling.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use sensorbus_types::DeviceAddress;

/// Events emitted by a session.
///
/// All events are serializable for logging, persistence, and IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// Device connected and its characteristics are resolved.
    Connected {
        address: DeviceAddress,
        characteristics: usize,
    },
    /// Device connection was lost or closed.
    Disconnected { address: DeviceAddress },
    /// A connection attempt failed and will be retried.
    ConnectRetry {
        address: DeviceAddress,
        attempt: u32,
        error: String,
    },
    /// Reconnection started after a disconnect.
    ReconnectStarted { address: DeviceAddress },
    /// A connection task failed fatally.
    ConnectionFailed { address: DeviceAddress, error: String },
    /// The session stopped.
    SessionStopped { reason: String },
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
