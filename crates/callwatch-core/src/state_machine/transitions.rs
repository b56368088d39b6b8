//! Transition table for call sessions
//!
//! ```text
//! pending ──accept──────────▶ active
//!    │ ──decline (regular)──▶ declined
//!    │ ──timeout (regular)──▶ expired
//!    │ ──timeout/escalate───▶ escalated ──accept──▶ active
//!    │     (emergency)             └──claim window──▶ expired
//!    └─ any non-terminal ──stop──▶ stopped
//! ```

use crate::types::{CallKind, CallState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallAction {
    Accept,
    Decline,
    ResponseTimeout,
    ManualEscalate,
    ExpireEscalated,
    Stop,
}

impl CallAction {
    pub fn name(&self) -> &'static str {
        match self {
            CallAction::Accept => "accept",
            CallAction::Decline => "decline",
            CallAction::ResponseTimeout => "expire response window",
            CallAction::ManualEscalate => "escalate",
            CallAction::ExpireEscalated => "expire escalation",
            CallAction::Stop => "stop",
        }
    }
}

/// Next state for `action`, or `None` if the table forbids it
pub fn next_state(kind: CallKind, from: CallState, action: CallAction) -> Option<CallState> {
    use CallAction::*;
    use CallState::*;

    match (action, from) {
        (Accept, Pending) | (Accept, Escalated) => Some(Active),
        (Decline, Pending) if kind == CallKind::Regular => Some(Declined),
        (ResponseTimeout, Pending) => Some(match kind {
            CallKind::Emergency => Escalated,
            CallKind::Regular => Expired,
        }),
        (ManualEscalate, Pending) if kind == CallKind::Emergency => Some(Escalated),
        (ExpireEscalated, Escalated) => Some(Expired),
        (Stop, state) if !state.is_terminal() => Some(Stopped),
        _ => None,
    }
}
