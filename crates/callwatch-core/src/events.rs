//! Call lifecycle events broadcast to in-process consumers

use serde::{Deserialize, Serialize};

use crate::types::{CallState, EscalationRecord, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    Created {
        session_id: SessionId,
    },
    StateChanged {
        session_id: SessionId,
        from: CallState,
        to: CallState,
    },
    /// One minute (or the configured lead) before auto-escalation
    ResponseWarning {
        session_id: SessionId,
        remaining_secs: u64,
    },
    Escalated {
        record: EscalationRecord,
    },
    DeliveryFailed {
        session_id: SessionId,
        reason: String,
    },
}

impl CallEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            CallEvent::Created { session_id }
            | CallEvent::StateChanged { session_id, .. }
            | CallEvent::ResponseWarning { session_id, .. }
            | CallEvent::DeliveryFailed { session_id, .. } => session_id,
            CallEvent::Escalated { record } => &record.session_id,
        }
    }
}
