//! In-memory session store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{SessionStore, StoreChange};
use crate::error::{CallwatchError, Result};
use crate::types::{
    AlertId, AuditEntry, CallSession, EscalationRecord, MonitoringAlert, SessionId, UserId,
};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Process-local store with per-session atomic versioned updates
#[derive(Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<SessionId, CallSession>>,
    escalations: Arc<RwLock<Vec<EscalationRecord>>>,
    alerts: Arc<DashMap<AlertId, MonitoringAlert>>,
    audit: Arc<RwLock<Vec<AuditEntry>>>,
    revision: Arc<AtomicU64>,
    changes: broadcast::Sender<StoreChange>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            sessions: Arc::new(DashMap::new()),
            escalations: Arc::new(RwLock::new(Vec::new())),
            alerts: Arc::new(DashMap::new()),
            audit: Arc::new(RwLock::new(Vec::new())),
            revision: Arc::new(AtomicU64::new(0)),
            changes,
        }
    }

    fn publish(&self, change: StoreChange) {
        self.revision.fetch_add(1, Ordering::AcqRel);
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<CallSession>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn create(&self, mut session: CallSession) -> Result<CallSession> {
        session.version = 1;
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => {
                return Err(CallwatchError::Store(format!("session {} already exists", session.id)))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session.clone());
            }
        }
        info!("Stored new {:?} session {}", session.kind, session.id);
        self.publish(StoreChange::Session(session.id.clone()));
        Ok(session)
    }

    async fn update(&self, mut session: CallSession, expected_version: u64) -> Result<CallSession> {
        let session_id = session.id.clone();
        {
            let mut stored = self
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| CallwatchError::NotFound(format!("session {}", session_id)))?;

            if stored.version != expected_version {
                return Err(CallwatchError::StoreConflict {
                    session_id,
                    expected: expected_version,
                    actual: stored.version,
                });
            }

            session.version = expected_version + 1;
            *stored = session.clone();
        }
        debug!("Updated session {} to version {}", session.id, session.version);
        self.publish(StoreChange::Session(session.id.clone()));
        Ok(session)
    }

    async fn list_sessions(&self) -> Result<Vec<CallSession>> {
        Ok(self.sessions.iter().map(|e| e.value().clone()).collect())
    }

    async fn append_escalation(&self, record: EscalationRecord) -> Result<()> {
        let session_id = record.session_id.clone();
        self.escalations.write().push(record);
        self.publish(StoreChange::Session(session_id));
        Ok(())
    }

    async fn claim_escalation(&self, session_id: &SessionId, staff_id: &UserId) -> Result<bool> {
        let claimed = {
            let mut records = self.escalations.write();
            match records
                .iter_mut()
                .rev()
                .find(|r| &r.session_id == session_id && r.escalated_to.is_none())
            {
                Some(record) => {
                    record.escalated_to = Some(staff_id.clone());
                    true
                }
                None => false,
            }
        };
        if claimed {
            self.publish(StoreChange::Session(session_id.clone()));
        }
        Ok(claimed)
    }

    async fn list_escalations(&self, session_id: &SessionId) -> Result<Vec<EscalationRecord>> {
        Ok(self
            .escalations
            .read()
            .iter()
            .filter(|r| &r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn create_alert(&self, alert: MonitoringAlert) -> Result<MonitoringAlert> {
        match self.alerts.entry(alert.id.clone()) {
            Entry::Occupied(_) => {
                return Err(CallwatchError::Store(format!("alert {} already exists", alert.id)))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(alert.clone());
            }
        }
        self.publish(StoreChange::Alert {
            alert_id: alert.id.clone(),
            session_id: alert.session_id.clone(),
        });
        Ok(alert)
    }

    async fn get_alert(&self, alert_id: &AlertId) -> Result<Option<MonitoringAlert>> {
        Ok(self.alerts.get(alert_id).map(|a| a.clone()))
    }

    async fn resolve_alert(&self, alert_id: &AlertId, actor_id: &UserId, at: DateTime<Utc>) -> Result<MonitoringAlert> {
        let (resolved, newly) = {
            let mut alert = self
                .alerts
                .get_mut(alert_id)
                .ok_or_else(|| CallwatchError::NotFound(format!("alert {}", alert_id)))?;
            let newly = !alert.resolved;
            if newly {
                alert.resolved = true;
                alert.resolved_by = Some(actor_id.clone());
                alert.resolved_at = Some(at);
            }
            (alert.clone(), newly)
        };
        if newly {
            self.publish(StoreChange::Alert {
                alert_id: resolved.id.clone(),
                session_id: resolved.session_id.clone(),
            });
        }
        Ok(resolved)
    }

    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<MonitoringAlert>> {
        let mut alerts: Vec<MonitoringAlert> = self
            .alerts
            .iter()
            .filter(|a| !unresolved_only || !a.resolved)
            .map(|a| a.value().clone())
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.audit.write().push(entry);
        Ok(())
    }

    async fn list_audit(&self, session_id: &SessionId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .iter()
            .filter(|e| &e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn revision(&self) -> Result<u64> {
        Ok(self.revision.load(Ordering::Acquire))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StoreChange>> {
        Some(self.changes.subscribe())
    }
}
