//! Error types for callwatch-core

use thiserror::Error;

use crate::types::{CallState, SessionId};

/// Errors produced by the escalation and monitoring core.
#[derive(Debug, Error)]
pub enum CallwatchError {
    /// Unknown session, alert or user id
    #[error("Not found: {0}")]
    NotFound(String),

    /// The transition table does not allow this operation from the current state
    #[error("Invalid transition for session {session_id}: cannot {action} from {from}")]
    InvalidTransition {
        session_id: SessionId,
        from: CallState,
        action: &'static str,
    },

    /// Emergency calls can never be declined
    #[error("Emergency session {0} cannot be declined")]
    CannotDecline(SessionId),

    /// Another responder already answered the session
    #[error("Session {session_id} was already handled by {handled_by}")]
    AlreadyHandled {
        session_id: SessionId,
        handled_by: String,
    },

    /// A second timer was scheduled for a session that still has a pending one.
    /// Internal invariant violation; callers should never observe it.
    #[error("Duplicate timer for session {0}")]
    DuplicateTimer(SessionId),

    /// Optimistic concurrency version mismatch
    #[error("Store conflict on session {session_id}: expected version {expected}, found {actual}")]
    StoreConflict {
        session_id: SessionId,
        expected: u64,
        actual: u64,
    },

    /// Conflicts persisted after the bounded retry budget
    #[error("Session {0} is busy, retry later")]
    Busy(SessionId),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Notification delivery failed: {0}")]
    Dispatch(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CallwatchError {
    /// Stable machine-readable code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            CallwatchError::NotFound(_) => "not_found",
            CallwatchError::InvalidTransition { .. } => "invalid_transition",
            CallwatchError::CannotDecline(_) => "cannot_decline",
            CallwatchError::AlreadyHandled { .. } => "already_handled",
            CallwatchError::DuplicateTimer(_) => "duplicate_timer",
            CallwatchError::StoreConflict { .. } => "store_conflict",
            CallwatchError::Busy(_) => "busy",
            CallwatchError::Store(_) => "store_error",
            CallwatchError::Dispatch(_) => "dispatch_error",
            CallwatchError::Config(_) => "config_error",
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CallwatchError::StoreConflict { .. }
                | CallwatchError::Busy(_)
                | CallwatchError::Dispatch(_)
        )
    }
}

impl From<config::ConfigError> for CallwatchError {
    fn from(err: config::ConfigError) -> Self {
        CallwatchError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CallwatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_recoverability() {
        let id = SessionId::from("s-1");
        let conflict = CallwatchError::StoreConflict {
            session_id: id.clone(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(conflict.code(), "store_conflict");
        assert!(conflict.is_recoverable());

        let decline = CallwatchError::CannotDecline(id);
        assert_eq!(decline.code(), "cannot_decline");
        assert!(!decline.is_recoverable());
        assert_eq!(decline.to_string(), "Emergency session s-1 cannot be declined");
    }
}
