//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    /// The peer sent us the INVITE
    Incoming,
    /// We sent the INVITE
    Outgoing,
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call
    #[default]
    Idle,
    /// INVITE sent (or being prepared), no provisional response yet
    Calling,
    /// 180/183 received for our INVITE
    Ringing,
    /// INVITE received, waiting for the user to answer
    Incoming,
    /// Dialog established, media flowing
    Connected,
    /// Local hold in effect
    Holding,
    /// Call ended; decays to Idle after a grace window
    Disconnected,
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &CallState) -> bool {
        use CallState::*;

        match (self, new_state) {
            // A fresh call may only start from a resting state
            (Idle, Calling) | (Idle, Incoming) => true,
            (Disconnected, Calling) | (Disconnected, Incoming) | (Disconnected, Idle) => true,

            // Outgoing setup
            (Calling, Calling) | (Calling, Ringing) | (Calling, Connected) => true,
            (Ringing, Ringing) | (Ringing, Connected) => true,

            // Incoming setup
            (Incoming, Connected) => true,

            // In-call
            (Connected, Holding) | (Holding, Connected) => true,

            // Teardown is always reachable from a live call
            (Calling, Disconnected)
            | (Ringing, Disconnected)
            | (Incoming, Disconnected)
            | (Connected, Disconnected)
            | (Holding, Disconnected) => true,

            _ => false,
        }
    }

    /// States from which a new outgoing or incoming call may start
    pub fn is_resting(&self) -> bool {
        matches!(self, CallState::Idle | CallState::Disconnected)
    }

    /// States with an established dialog
    pub fn is_established(&self) -> bool {
        matches!(self, CallState::Connected | CallState::Holding)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Incoming => "incoming",
            CallState::Connected => "connected",
            CallState::Holding => "holding",
            CallState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reason for call ending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The local user hung up
    LocalHangup,
    /// The peer sent BYE
    RemoteHangup,
    /// The peer answered 486
    Busy,
    /// 487 for our INVITE, or CANCEL from the peer
    Canceled,
    /// 3xx for our INVITE
    Redirected(u16),
    /// Any other final failure response
    Rejected(u16),
    /// Credentials were refused
    AuthenticationFailed,
    /// A hold/resume re-INVITE was refused
    ReinviteFailed(u16),
    /// Engine shutdown or unregister with a live call
    Shutdown,
    /// The INVITE or its answer could not be sent
    TransportFailure,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => write!(f, "local hangup"),
            EndReason::RemoteHangup => write!(f, "remote hangup"),
            EndReason::Busy => write!(f, "busy"),
            EndReason::Canceled => write!(f, "canceled"),
            EndReason::Redirected(code) => write!(f, "redirect {}", code),
            EndReason::Rejected(code) => write!(f, "rejected {}", code),
            EndReason::AuthenticationFailed => write!(f, "authentication failed"),
            EndReason::ReinviteFailed(code) => write!(f, "re-INVITE failed {}", code),
            EndReason::Shutdown => write!(f, "shutdown"),
            EndReason::TransportFailure => write!(f, "transport failure"),
        }
    }
}
