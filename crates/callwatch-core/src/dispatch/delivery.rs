use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{AlertPayload, AlertTarget, NotificationDispatcher, NotificationKind};
use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::directory::UserDirectory;
use crate::error::{CallwatchError, Result};
use crate::events::CallEvent;
use crate::store::{modify_session, SessionStore};
use crate::types::{
    AuditAction, AuditEntry, CallSession, EscalationRecord, MonitoringAlert, SessionId, Severity,
};

pub const DELIVERY_FAILED_ALERT_TYPE: &str = "delivery_failed";

/// Retrying front of the notification dispatcher
pub struct DeliveryService {
    dispatcher: Arc<dyn NotificationDispatcher>,
    directory: Arc<dyn UserDirectory>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
    max_conflict_retries: u32,
    events: broadcast::Sender<CallEvent>,
}

impl DeliveryService {
    pub fn new(
        dispatcher: Arc<dyn NotificationDispatcher>,
        directory: Arc<dyn UserDirectory>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
        max_conflict_retries: u32,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            dispatcher,
            directory,
            store,
            clock,
            config,
            max_conflict_retries,
            events,
        }
    }

    /// Deliver one notification, retrying with exponential backoff
    pub async fn deliver(&self, target: &AlertTarget, payload: &AlertPayload, repeat: bool) -> Result<()> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.dispatcher.alert(target, payload, repeat).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Delivered {:?} to {} after {} attempts", payload.kind, target, attempt);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Delivery of {:?} to {} failed (attempt {}/{}): {}",
                        payload.kind, target, attempt, max_attempts, e
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(CallwatchError::Dispatch(format!(
            "{} unreachable after {} attempts: {}",
            target,
            max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Alert the assigned reader; exhaustion is reported, never dropped
    pub async fn notify_reader(&self, session: &CallSession, payload: AlertPayload, repeat: bool) {
        let Some(reader_id) = session.reader_id.clone() else {
            warn!("Session {} has no reader to notify", session.id);
            return;
        };

        let target = AlertTarget::Reader(reader_id);
        if let Err(e) = self.deliver(&target, &payload, repeat).await {
            self.report_delivery_failure(&session.id, &e.to_string()).await;
        }
    }

    /// Best-effort notification that does not mark the session on failure
    pub async fn notify_quietly(&self, target: AlertTarget, payload: AlertPayload) {
        if let Err(e) = self.deliver(&target, &payload, false).await {
            debug!("Dropping {:?} for {}: {}", payload.kind, target, e);
        }
    }

    /// Fan an escalation out to every admin and monitor, least loaded first.
    ///
    /// Returns the number of staff reached. Zero reachable staff marks the
    /// session as delivery-failed and raises a system alert.
    pub async fn fan_out_escalation(&self, session: &CallSession, record: &EscalationRecord) -> usize {
        let staff = match self.directory.staff_pool().await {
            Ok(staff) => staff,
            Err(e) => {
                self.report_delivery_failure(&session.id, &format!("staff pool unavailable: {}", e))
                    .await;
                return 0;
            }
        };

        if staff.is_empty() {
            self.report_delivery_failure(&session.id, "staff pool is empty").await;
            return 0;
        }

        let mut ordered = Vec::with_capacity(staff.len());
        for member in staff {
            let load = self.dispatcher.current_load(&member.id).await;
            ordered.push((load.unwrap_or(u32::MAX), member));
        }
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

        let payload = AlertPayload {
            session_id: session.id.clone(),
            kind: NotificationKind::Escalation,
            call_kind: session.kind,
            channel: session.channel,
            declinable: false,
            audible: None,
            message: format!(
                "Emergency session {} escalated ({:?}) from {}",
                session.id,
                record.reason,
                record.escalated_from.as_deref().unwrap_or("unassigned")
            ),
        };

        let mut reached = 0;
        for (_, member) in &ordered {
            let target = AlertTarget::Staff(member.id.clone());
            match self.deliver(&target, &payload, true).await {
                Ok(()) => reached += 1,
                Err(e) => warn!("Escalation of {} not delivered to {}: {}", session.id, target, e),
            }
        }

        if reached == 0 {
            self.report_delivery_failure(&session.id, "no staff member reachable").await;
        } else {
            info!("🚨 Escalation of {} delivered to {}/{} staff", session.id, reached, ordered.len());
        }
        reached
    }

    /// Push a fresh alert to every staff member
    pub async fn push_to_staff(&self, payload: AlertPayload) {
        let staff = match self.directory.staff_pool().await {
            Ok(staff) => staff,
            Err(e) => {
                warn!("Cannot push {:?}: {}", payload.kind, e);
                return;
            }
        };
        for member in staff {
            self.notify_quietly(AlertTarget::Staff(member.id), payload.clone()).await;
        }
    }

    /// Flag the session, raise a critical system alert and audit the failure
    pub async fn report_delivery_failure(&self, session_id: &SessionId, reason: &str) {
        error!("Notification delivery failed for session {}: {}", session_id, reason);

        let flagged = modify_session(self.store.as_ref(), session_id, self.max_conflict_retries, |s| {
            if s.delivery_failed {
                return Ok(None);
            }
            let mut next = s.clone();
            next.delivery_failed = true;
            Ok(Some(next))
        })
        .await;
        if let Err(e) = flagged {
            error!("Could not mark session {} as delivery-failed: {}", session_id, e);
        }

        let now = self.clock.now();
        let alert = MonitoringAlert::from_system(
            session_id.clone(),
            DELIVERY_FAILED_ALERT_TYPE,
            reason,
            Severity::Critical,
            now,
        );
        if let Err(e) = self.store.create_alert(alert).await {
            error!("Could not raise delivery-failure alert for {}: {}", session_id, e);
        }

        let entry = AuditEntry::new(
            session_id.clone(),
            None,
            AuditAction::DeliveryFailed,
            Some(reason.to_string()),
            now,
        );
        if let Err(e) = self.store.append_audit(entry).await {
            error!("Could not audit delivery failure for {}: {}", session_id, e);
        }

        let _ = self.events.send(CallEvent::DeliveryFailed {
            session_id: session_id.clone(),
            reason: reason.to_string(),
        });
    }
}
