//! Session store collaborator
//!
//! The store is the single source of truth for sessions, escalation records,
//! monitoring alerts and the audit log. Session updates are versioned
//! compare-and-swap writes: an update carrying a stale `expected_version`
//! fails with `StoreConflict` and the caller retries against the latest copy.

mod memory;

pub use memory::InMemorySessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{CallwatchError, Result};
use crate::types::{
    AlertId, AuditEntry, CallSession, EscalationRecord, MonitoringAlert, SessionId, UserId,
};

/// Mutation notification published by push-capable stores
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Session(SessionId),
    Alert { alert_id: AlertId, session_id: SessionId },
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &SessionId) -> Result<Option<CallSession>>;

    /// Insert a new session. Fails if the id already exists.
    async fn create(&self, session: CallSession) -> Result<CallSession>;

    /// Replace the session if its stored version equals `expected_version`.
    /// Returns the stored copy with the bumped version.
    async fn update(&self, session: CallSession, expected_version: u64) -> Result<CallSession>;

    async fn list_sessions(&self) -> Result<Vec<CallSession>>;

    async fn append_escalation(&self, record: EscalationRecord) -> Result<()>;

    /// Fill `escalated_to` on the latest unclaimed record. Returns false if
    /// there is nothing left to claim.
    async fn claim_escalation(&self, session_id: &SessionId, staff_id: &UserId) -> Result<bool>;

    async fn list_escalations(&self, session_id: &SessionId) -> Result<Vec<EscalationRecord>>;

    async fn create_alert(&self, alert: MonitoringAlert) -> Result<MonitoringAlert>;

    async fn get_alert(&self, alert_id: &AlertId) -> Result<Option<MonitoringAlert>>;

    /// Mark an alert resolved at `at`. Resolving twice keeps the first resolution.
    async fn resolve_alert(&self, alert_id: &AlertId, actor_id: &UserId, at: DateTime<Utc>) -> Result<MonitoringAlert>;

    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<MonitoringAlert>>;

    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;

    async fn list_audit(&self, session_id: &SessionId) -> Result<Vec<AuditEntry>>;

    /// Monotonic counter bumped on every mutation, used by polling feeds
    async fn revision(&self) -> Result<u64>;

    /// Push notifications, `None` if the store can only be polled
    fn subscribe(&self) -> Option<broadcast::Receiver<StoreChange>> {
        None
    }
}

/// Result of a read-modify-write against the store
#[derive(Debug, Clone)]
pub struct Modified {
    pub previous: CallSession,
    pub current: CallSession,
}

impl Modified {
    pub fn changed(&self) -> bool {
        self.previous.version != self.current.version
    }
}

/// Read-modify-write a session with bounded retries on version conflicts.
///
/// `apply` returns `Ok(None)` to leave the session unchanged, `Ok(Some(next))`
/// to write `next`, or an error to abort. It is re-run against the latest
/// copy after every conflict. Exhausting `max_attempts` yields `Busy`.
pub async fn modify_session<S, F>(
    store: &S,
    session_id: &SessionId,
    max_attempts: u32,
    mut apply: F,
) -> Result<Modified>
where
    S: SessionStore + ?Sized,
    F: FnMut(&CallSession) -> Result<Option<CallSession>> + Send,
{
    let attempts = max_attempts.max(1);

    for attempt in 1..=attempts {
        let current = store
            .get(session_id)
            .await?
            .ok_or_else(|| CallwatchError::NotFound(format!("session {}", session_id)))?;

        let next = match apply(&current)? {
            None => {
                return Ok(Modified {
                    previous: current.clone(),
                    current,
                })
            }
            Some(next) => next,
        };

        match store.update(next, current.version).await {
            Ok(saved) => {
                return Ok(Modified {
                    previous: current,
                    current: saved,
                })
            }
            Err(CallwatchError::StoreConflict { expected, actual, .. }) => {
                debug!(
                    "Version conflict on session {} (attempt {}/{}, expected {}, found {})",
                    session_id, attempt, attempts, expected, actual
                );
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(CallwatchError::Busy(session_id.clone()))
}
