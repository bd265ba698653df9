//! Lifecycle events surfaced to applications.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::{Phase, TransportMode, unix_millis};

/// A discrete change in a transport's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TransportEvent {
    /// A first connection attempt started.
    Connecting {
        /// `host:port` being dialed.
        target: String,
    },
    /// First connection established.
    Connected {
        /// Mode that won.
        mode: TransportMode,
        /// Whether QUIC resumed with 0-RTT.
        #[serde(rename = "zeroRtt")]
        zero_rtt: bool,
    },
    /// QUIC failed and TCP+TLS is being tried.
    FallbackToTcp {
        /// Why QUIC failed.
        reason: String,
    },
    /// An established link dropped.
    ConnectionLost {
        /// Cause of the drop.
        reason: String,
        /// Whether reconnection will be attempted.
        transient: bool,
    },
    /// A reconnection attempt is scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Backoff before the attempt.
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
    /// A reconnection attempt succeeded.
    Reconnected {
        /// Mode that won.
        mode: TransportMode,
        /// Attempts it took.
        attempts: u32,
    },
    /// Connection is terminally failed; no more automatic retries.
    Failed {
        /// Final cause.
        reason: String,
    },
    /// The transport was closed locally.
    Disconnected,
}

/// An event stamped with wall-clock time and the phase it left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Phase after the event.
    pub phase: Phase,
    /// The event.
    #[serde(flatten)]
    pub event: TransportEvent,
}

/// Broadcast fan-out of [`EventRecord`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Bus with the default buffer size.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn emit(&self, phase: Phase, event: TransportEvent) {
        trace!(?event, %phase, "lifecycle event");
        let _ = self.tx.send(EventRecord {
            timestamp: unix_millis(),
            phase,
            event,
        });
    }

    /// New receiver seeing events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}
