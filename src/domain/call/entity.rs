//! Call entity

use super::value_object::{CallDirection, CallState};
use crate::domain::shared::{DomainError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The metadata of the one call the engine tracks.
///
/// Created when a call attempt starts, mutated in place while it runs and
/// dropped when the engine decays back to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub id: String,
    pub number: String,
    pub name: Option<String>,
    pub state: CallState,
    /// Seconds since the call reached `Connected`
    pub duration: u32,
    pub direction: CallDirection,
    pub started_at: DateTime<Utc>,
}

impl CallInfo {
    pub fn outgoing(id: String, number: String) -> Self {
        Self {
            id,
            number,
            name: None,
            state: CallState::Calling,
            duration: 0,
            direction: CallDirection::Outgoing,
            started_at: Utc::now(),
        }
    }

    pub fn incoming(id: String, number: String, name: Option<String>) -> Self {
        Self {
            id,
            number,
            name,
            state: CallState::Incoming,
            duration: 0,
            direction: CallDirection::Incoming,
            started_at: Utc::now(),
        }
    }

    /// Move to `next`, rejecting transitions the state table forbids.
    pub fn transition(&mut self, next: CallState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(&next) {
            return Err(DomainError::InvalidStateTransition(format!(
                "{} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_call_lifecycle() {
        let mut call = CallInfo::outgoing("call-1".to_string(), "1001".to_string());
        assert_eq!(call.state, CallState::Calling);
        assert_eq!(call.direction, CallDirection::Outgoing);

        call.transition(CallState::Ringing).unwrap();
        call.transition(CallState::Connected).unwrap();
        call.transition(CallState::Holding).unwrap();
        call.transition(CallState::Disconnected).unwrap();
        assert_eq!(call.state, CallState::Disconnected);
    }

    #[test]
    fn test_rejected_transition_keeps_state() {
        let mut call = CallInfo::incoming("call-2".to_string(), "200".to_string(), None);
        let err = call.transition(CallState::Holding).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition(_)));
        assert_eq!(call.state, CallState::Incoming);
    }
}
