//! Discrete engine events for observers

use crate::domain::{CallDirection, CallState, RegistrationState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event broadcast to every subscriber of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    RegistrationStateChanged {
        old_state: RegistrationState,
        new_state: RegistrationState,
    },
    /// Transport dropped; a reconnect is scheduled
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// Reconnect attempts exhausted
    ReconnectAbandoned { attempts: u32 },
    CallStateChanged {
        call_id: String,
        old_state: CallState,
        new_state: CallState,
    },
    IncomingCall {
        call_id: String,
        number: String,
        name: Option<String>,
    },
    CallStarted {
        call_id: String,
        number: String,
        direction: CallDirection,
    },
    CallEnded {
        call_id: String,
        duration: u32,
        reason: String,
    },
    /// The peer put us on hold or resumed
    RemoteHold { call_id: String, on_hold: bool },
    DtmfSent { call_id: String, digit: char },
    TransferAccepted { call_id: String, target: String },
    TransferFailed {
        call_id: String,
        target: String,
        status: u16,
    },
    MediaStateChanged { call_id: String, state: String },
    Warning { message: String },
}

/// Event broadcaster
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event
    pub fn publish(&self, event: EngineEvent) {
        // Ignore send errors (no receivers)
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
