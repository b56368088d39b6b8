use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::MonitoringConfig;
use crate::error::{CallwatchError, Result};
use crate::state_machine::CallStateMachine;
use crate::store::SessionStore;
use crate::types::{
    AlertId, AlertSource, AuditAction, AuditEntry, CallSession, MonitoringAlert, SessionId, Severity, UserId,
};

/// Supervisor interventions on live sessions.
///
/// Identical flags and repeated joins by the same actor inside the dedup
/// window return the existing alert or audit entry instead of stacking.
pub struct MonitorActionHandler {
    machine: Arc<CallStateMachine>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    dedup_window: ChronoDuration,
    // Serialises the check-then-insert of deduplicated writes
    dedup_lock: Mutex<()>,
}

impl MonitorActionHandler {
    pub fn new(machine: Arc<CallStateMachine>, clock: Arc<dyn Clock>, config: &MonitoringConfig) -> Self {
        Self {
            store: machine.store().clone(),
            machine,
            clock,
            dedup_window: ChronoDuration::from_std(config.flag_dedup_window())
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            dedup_lock: Mutex::new(()),
        }
    }

    /// Attach as a silent observer. Never changes session state.
    pub async fn join(&self, session_id: &SessionId, actor_id: impl Into<UserId>) -> Result<AuditEntry> {
        let actor_id = actor_id.into();
        let session = self.live_session(session_id, "join").await?;

        let _guard = self.dedup_lock.lock().await;
        let now = self.clock.now();
        let recent = self
            .store
            .list_audit(&session.id)
            .await?
            .into_iter()
            .rev()
            .find(|entry| {
                entry.action == AuditAction::MonitorJoined
                    && entry.actor_id.as_ref() == Some(&actor_id)
                    && now - entry.at <= self.dedup_window
            });
        if let Some(entry) = recent {
            debug!("{} already observing {}, join merged", actor_id, session.id);
            return Ok(entry);
        }

        let entry = AuditEntry::new(session.id.clone(), Some(actor_id.clone()), AuditAction::MonitorJoined, None, now);
        self.store.append_audit(entry.clone()).await?;
        info!("👁 {} joined session {} as silent observer", actor_id, session.id);
        Ok(entry)
    }

    /// Raise an unresolved monitor alert. Never changes session state.
    pub async fn flag(
        &self,
        session_id: &SessionId,
        actor_id: impl Into<UserId>,
        reason: impl Into<String>,
        severity: Severity,
    ) -> Result<MonitoringAlert> {
        let actor_id = actor_id.into();
        let reason = reason.into();
        let session = self.machine.get(session_id).await?;

        let _guard = self.dedup_lock.lock().await;
        let now = self.clock.now();
        let duplicate = self.store.list_alerts(true).await?.into_iter().find(|alert| {
            alert.session_id == session.id
                && alert.source == AlertSource::Monitor
                && alert.raised_by.as_ref() == Some(&actor_id)
                && alert.reason.as_ref() == Some(&reason)
                && alert.severity == severity
                && now - alert.created_at <= self.dedup_window
        });
        if let Some(alert) = duplicate {
            debug!("Identical flag on {} by {} merged into {}", session.id, actor_id, alert.id);
            return Ok(alert);
        }

        let alert = self
            .store
            .create_alert(MonitoringAlert::from_monitor(
                session.id.clone(),
                actor_id.clone(),
                reason.clone(),
                severity,
                now,
            ))
            .await?;
        self.store
            .append_audit(AuditEntry::new(
                session.id.clone(),
                Some(actor_id.clone()),
                AuditAction::Flagged,
                Some(reason),
                now,
            ))
            .await?;
        info!("🚩 {} flagged session {} ({:?})", actor_id, session.id, severity);
        Ok(alert)
    }

    /// Terminate a session from any non-terminal state
    pub async fn force_stop(
        &self,
        session_id: &SessionId,
        actor_id: impl Into<UserId>,
        reason: impl Into<String>,
    ) -> Result<CallSession> {
        self.machine.stop(session_id, actor_id, reason).await
    }

    pub async fn resolve_alert(&self, alert_id: &AlertId, actor_id: impl Into<UserId>) -> Result<MonitoringAlert> {
        let actor_id = actor_id.into();
        let before = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| CallwatchError::NotFound(format!("alert {}", alert_id)))?;

        let now = self.clock.now();
        let alert = self.store.resolve_alert(alert_id, &actor_id, now).await?;
        if !before.resolved {
            self.store
                .append_audit(AuditEntry::new(
                    alert.session_id.clone(),
                    Some(actor_id.clone()),
                    AuditAction::AlertResolved,
                    Some(alert.id.to_string()),
                    now,
                ))
                .await?;
            info!("✅ Alert {} on session {} resolved by {}", alert.id, alert.session_id, actor_id);
        }
        Ok(alert)
    }

    async fn live_session(&self, session_id: &SessionId, action: &'static str) -> Result<CallSession> {
        let session = self.machine.get(session_id).await?;
        if session.state.is_terminal() {
            return Err(CallwatchError::InvalidTransition {
                session_id: session.id,
                from: session.state,
                action,
            });
        }
        Ok(session)
    }
}
