//! # Call State Machine
//!
//! Governs one call session from creation to a terminal state and owns the
//! per-session escalation timers. Every transition is a versioned
//! read-modify-write against the [`SessionStore`], so concurrent commands on
//! one session are totally ordered and exactly one of two racing `accept`
//! calls wins.
//!
//! ## Response window
//!
//! Emergency sessions get `escalation_deadline = created_at + response window`
//! (five minutes by default) and a timer with a warning one minute before the
//! deadline. The assigned reader receives an undeclinable alert with a
//! repeating audible directive that lasts until the session leaves `pending`.
//! When the timer fires on a still-pending emergency the session becomes
//! `escalated`, one [`EscalationRecord`] is appended and the staff pool is
//! alerted in the background. Delivery problems never hold the transition
//! back; they are reported through the session's `delivery_failed` flag and a
//! system alert.
//!
//! Regular sessions use the ring timeout and simply expire.
//!
//! ## Timer ownership
//!
//! Only the state machine transitions sessions. A committed transition out
//! of `pending` or `escalated` cancels the session timer. A timer that fires
//! in the gap between the write and the cancel finds the session no longer
//! pending and does nothing.

mod transitions;

pub use transitions::{next_state, CallAction};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{CallwatchConfig, EscalationConfig};
use crate::directory::UserDirectory;
use crate::dispatch::{
    AlertPayload, AlertTarget, AudibleDirective, DeliveryService, NotificationDispatcher,
    NotificationKind,
};
use crate::error::{CallwatchError, Result};
use crate::events::CallEvent;
use crate::store::{modify_session, Modified, SessionStore};
use crate::timer::{EscalationTimers, TimerKind, TimerListener};
use crate::types::{
    AuditAction, AuditEntry, CallKind, CallSession, CallState, Channel, EscalationReason,
    EscalationRecord, MonitoringAlert, SessionId, Severity, UserId,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct CallStateMachine {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn UserDirectory>,
    delivery: Arc<DeliveryService>,
    timers: EscalationTimers,
    clock: Arc<dyn Clock>,
    config: EscalationConfig,
    max_conflict_retries: u32,
    events: broadcast::Sender<CallEvent>,
    warned: DashMap<SessionId, ()>,
    relay: Arc<TimerRelay>,
}

impl CallStateMachine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn UserDirectory>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
        config: &CallwatchConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let max_conflict_retries = config.store.max_conflict_retries;

        let delivery = Arc::new(DeliveryService::new(
            dispatcher,
            directory.clone(),
            store.clone(),
            clock.clone(),
            config.delivery.clone(),
            max_conflict_retries,
            events.clone(),
        ));

        Arc::new_cyclic(|weak: &Weak<CallStateMachine>| Self {
            store,
            directory,
            delivery,
            timers: EscalationTimers::new(clock.clone()),
            clock,
            config: config.escalation.clone(),
            max_conflict_retries,
            events,
            warned: DashMap::new(),
            relay: Arc::new(TimerRelay {
                machine: weak.clone(),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn delivery(&self) -> &Arc<DeliveryService> {
        &self.delivery
    }

    pub fn timers(&self) -> &EscalationTimers {
        &self.timers
    }

    pub async fn get(&self, session_id: &SessionId) -> Result<CallSession> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| CallwatchError::NotFound(format!("session {}", session_id)))
    }

    /// Open a new session in `pending` and start its response window
    pub async fn create(
        &self,
        client_id: impl Into<UserId>,
        kind: CallKind,
        channel: Channel,
        target_reader_id: Option<UserId>,
    ) -> Result<CallSession> {
        let client_id = client_id.into();
        let reader_id = match target_reader_id {
            Some(reader_id) => {
                if self.directory.lookup(&reader_id).await?.is_none() {
                    return Err(CallwatchError::NotFound(format!("reader {}", reader_id)));
                }
                Some(reader_id)
            }
            None => self.pick_available_reader().await?,
        };

        let now = self.clock.now();
        let mut session = CallSession::new(client_id.clone(), reader_id, kind, channel, now);

        let deadline = match kind {
            CallKind::Emergency => Some(now + to_chrono(self.config.response_window())),
            CallKind::Regular => self.config.regular_ring_timeout().map(|t| now + to_chrono(t)),
        };
        if kind == CallKind::Emergency {
            session.escalation_deadline = deadline;
        }

        let session = self.store.create(session).await?;
        info!(
            "📞 Created {:?} {:?} session {} for client {} (reader: {})",
            kind,
            channel,
            session.id,
            client_id,
            session.reader_id.as_deref().unwrap_or("unassigned")
        );

        self.audit(&session.id, Some(client_id), AuditAction::Created, None).await;
        let _ = self.events.send(CallEvent::Created {
            session_id: session.id.clone(),
        });

        if let Some(deadline) = deadline {
            let warn_at = match kind {
                CallKind::Emergency => Some(deadline - to_chrono(self.config.warning_lead())),
                CallKind::Regular => None,
            };
            self.timers.schedule(
                session.id.clone(),
                TimerKind::Response,
                deadline,
                warn_at,
                self.relay.clone(),
            )?;
        }

        if session.reader_id.is_some() {
            let emergency = session.is_emergency();
            let payload = self.incoming_payload(&session);
            let delivery = self.delivery.clone();
            let target = session.clone();
            tokio::spawn(async move {
                delivery.notify_reader(&target, payload, emergency).await;
            });
        } else {
            warn!("No reader available for session {}, waiting for the response window", session.id);
        }

        Ok(session)
    }

    /// Answer a pending or escalated session
    pub async fn accept(&self, session_id: &SessionId, responder_id: impl Into<UserId>) -> Result<CallSession> {
        let responder_id = responder_id.into();
        let now = self.clock.now();

        let modified = modify_session(self.store.as_ref(), session_id, self.max_conflict_retries, |s| {
            if s.state == CallState::Active {
                return match &s.responder_id {
                    Some(current) if current == &responder_id => Ok(None),
                    current => Err(CallwatchError::AlreadyHandled {
                        session_id: s.id.clone(),
                        handled_by: current.clone().unwrap_or_default(),
                    }),
                };
            }

            let next_state = transition(s, CallAction::Accept)?;

            let mut next = s.clone();
            next.state = next_state;
            next.responder_id = Some(responder_id.clone());
            next.responded_at = Some(now);
            Ok(Some(next))
        })
        .await?;

        if !modified.changed() {
            debug!("Session {} already active with {}", session_id, responder_id);
            return Ok(modified.current);
        }

        if modified.previous.state == CallState::Escalated {
            match self.store.claim_escalation(session_id, &responder_id).await {
                Ok(true) => info!("Escalation of {} claimed by {}", session_id, responder_id),
                Ok(false) => warn!("Session {} was escalated but had no open escalation record", session_id),
                Err(e) => error!("Could not record escalation claim on {}: {}", session_id, e),
            }
        }

        self.finish_transition(&modified, Some(responder_id), AuditAction::Accepted, None).await;
        Ok(modified.current)
    }

    /// Decline a pending regular session. Emergencies can never be declined.
    pub async fn decline(&self, session_id: &SessionId, responder_id: impl Into<UserId>) -> Result<CallSession> {
        let responder_id = responder_id.into();
        let now = self.clock.now();

        let modified = modify_session(self.store.as_ref(), session_id, self.max_conflict_retries, |s| {
            if s.is_emergency() {
                return Err(CallwatchError::CannotDecline(s.id.clone()));
            }
            let next_state = transition(s, CallAction::Decline)?;

            let mut next = s.clone();
            next.state = next_state;
            next.ended_at = Some(now);
            Ok(Some(next))
        })
        .await?;

        self.finish_transition(&modified, Some(responder_id), AuditAction::Declined, None).await;
        Ok(modified.current)
    }

    /// Response window elapsed. No-op unless the session is still `pending`.
    pub async fn on_timer_expired(&self, session_id: &SessionId) -> Result<CallSession> {
        let now = self.clock.now();

        let modified = modify_session(self.store.as_ref(), session_id, self.max_conflict_retries, |s| {
            if s.state != CallState::Pending {
                return Ok(None);
            }
            let next_state = transition(s, CallAction::ResponseTimeout)?;

            let mut next = s.clone();
            next.state = next_state;
            if next_state == CallState::Expired {
                next.ended_at = Some(now);
            }
            Ok(Some(next))
        })
        .await?;

        if !modified.changed() {
            debug!(
                "Response window of {} elapsed in state {}, nothing to do",
                session_id, modified.current.state
            );
            return Ok(modified.current);
        }

        match modified.current.state {
            CallState::Escalated => {
                self.complete_escalation(&modified, EscalationReason::NoAnswer, None).await;
            }
            _ => {
                info!("⌛ Regular session {} expired unanswered", session_id);
                self.finish_transition(&modified, None, AuditAction::Expired, Some("no answer".to_string()))
                    .await;
                if self.config.alert_on_regular_expiry {
                    let alert = MonitoringAlert::from_system(
                        session_id.clone(),
                        "regular_call_expired",
                        "regular call expired unanswered",
                        Severity::Low,
                        now,
                    );
                    if let Err(e) = self.store.create_alert(alert).await {
                        error!("Could not raise expiry alert for {}: {}", session_id, e);
                    }
                }
            }
        }

        Ok(modified.current)
    }

    /// Escalate a pending emergency before its deadline
    pub async fn escalate(&self, session_id: &SessionId, actor_id: impl Into<UserId>) -> Result<CallSession> {
        let actor_id = actor_id.into();

        let modified = modify_session(self.store.as_ref(), session_id, self.max_conflict_retries, |s| {
            let next_state = transition(s, CallAction::ManualEscalate)?;

            let mut next = s.clone();
            next.state = next_state;
            Ok(Some(next))
        })
        .await?;

        self.complete_escalation(&modified, EscalationReason::Manual, Some(actor_id)).await;
        Ok(modified.current)
    }

    /// Give up on an escalated session nobody claimed
    pub async fn expire_escalated(&self, session_id: &SessionId) -> Result<CallSession> {
        let now = self.clock.now();

        let modified = modify_session(self.store.as_ref(), session_id, self.max_conflict_retries, |s| {
            let next_state = transition(s, CallAction::ExpireEscalated)?;

            let mut next = s.clone();
            next.state = next_state;
            next.ended_at = Some(now);
            Ok(Some(next))
        })
        .await?;

        warn!("Escalated session {} expired without being claimed", session_id);
        self.finish_transition(&modified, None, AuditAction::Expired, Some("escalation unclaimed".to_string()))
            .await;
        Ok(modified.current)
    }

    /// Supervisor override from any non-terminal state
    pub async fn stop(
        &self,
        session_id: &SessionId,
        actor_id: impl Into<UserId>,
        reason: impl Into<String>,
    ) -> Result<CallSession> {
        let actor_id = actor_id.into();
        let reason = reason.into();
        let now = self.clock.now();

        let modified = modify_session(self.store.as_ref(), session_id, self.max_conflict_retries, |s| {
            let next_state = transition(s, CallAction::Stop)?;

            let mut next = s.clone();
            next.state = next_state;
            next.ended_at = Some(now);
            Ok(Some(next))
        })
        .await?;

        info!("🛑 Session {} stopped by {}: {}", session_id, actor_id, reason);
        self.finish_transition(&modified, Some(actor_id), AuditAction::Stopped, Some(reason)).await;
        Ok(modified.current)
    }

    /// Cancel every pending timer
    pub fn shutdown(&self) {
        self.timers.cancel_all();
    }

    async fn on_warning(&self, session_id: &SessionId) {
        let session = match self.get(session_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Warning for unknown session {}: {}", session_id, e);
                return;
            }
        };
        if session.state != CallState::Pending {
            return;
        }
        if self.warned.insert(session_id.clone(), ()).is_some() {
            return;
        }

        let remaining_secs = session
            .escalation_deadline
            .map(|d| (d - self.clock.now()).num_seconds().max(0) as u64)
            .unwrap_or(0);
        warn!("⏰ Session {} escalates in {}s", session_id, remaining_secs);

        let _ = self.events.send(CallEvent::ResponseWarning {
            session_id: session_id.clone(),
            remaining_secs,
        });

        if let Some(reader_id) = session.reader_id.clone() {
            let mut payload = self.incoming_payload(&session);
            payload.kind = NotificationKind::ResponseWarning { remaining_secs };
            payload.message = format!("Emergency {} escalates in {}s", session.id, remaining_secs);
            let delivery = self.delivery.clone();
            tokio::spawn(async move {
                delivery.notify_quietly(AlertTarget::Reader(reader_id), payload).await;
            });
        }
    }

    /// Record, audit and fan out a committed escalation.
    ///
    /// The session is already `escalated` in the store, so nothing here may
    /// abort: a lost escalation record is surfaced as a delivery failure.
    async fn complete_escalation(&self, modified: &Modified, reason: EscalationReason, actor_id: Option<UserId>) {
        let session = &modified.current;
        let record = EscalationRecord {
            session_id: session.id.clone(),
            escalated_from: session.reader_id.clone(),
            escalated_to: None,
            reason,
            auto_escalated: reason == EscalationReason::NoAnswer,
            created_at: self.clock.now(),
        };

        let stored = self.store_escalation(&record).await;
        warn!("🚨 Session {} escalated ({:?})", session.id, reason);

        self.finish_transition(modified, actor_id, AuditAction::Escalated, Some(format!("{:?}", reason)))
            .await;
        let _ = self.events.send(CallEvent::Escalated { record: record.clone() });

        let delivery = self.delivery.clone();
        let escalated = session.clone();
        tokio::spawn(async move {
            if let Err(e) = stored {
                delivery
                    .report_delivery_failure(&escalated.id, &format!("escalation record not stored: {}", e))
                    .await;
            }
            delivery.fan_out_escalation(&escalated, &record).await;
        });

        if let Some(window) = self.config.claim_window() {
            self.schedule_claim_window(&session.id, window).await;
        }
    }

    async fn store_escalation(&self, record: &EscalationRecord) -> Result<()> {
        let attempts = self.max_conflict_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.store.append_escalation(record.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Storing escalation record for {} failed (attempt {}/{}): {}",
                        record.session_id, attempt, attempts, e
                    );
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Session {} escalated but the escalation record was not stored: {}",
                        record.session_id, e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Arm the claim window, then drop it again if a claim won the race
    async fn schedule_claim_window(&self, session_id: &SessionId, window: std::time::Duration) {
        let deadline = self.clock.now() + to_chrono(window);
        if let Err(e) = self
            .timers
            .schedule(session_id.clone(), TimerKind::ClaimWindow, deadline, None, self.relay.clone())
        {
            warn!("Claim window for {} not armed: {}", session_id, e);
            return;
        }

        match self.get(session_id).await {
            Ok(session) if session.state == CallState::Escalated => {}
            Ok(session) => {
                debug!("Session {} left escalation in state {}, claim window dropped", session_id, session.state);
                self.timers.cancel_session(session_id);
            }
            Err(e) => {
                warn!("Could not re-read {} after arming claim window: {}", session_id, e);
                self.timers.cancel_session(session_id);
            }
        }
    }

    /// Audit, publish and silence audible alerts after a committed transition
    async fn finish_transition(
        &self,
        modified: &Modified,
        actor_id: Option<UserId>,
        action: AuditAction,
        detail: Option<String>,
    ) {
        let previous = &modified.previous;
        let current = &modified.current;

        if matches!(previous.state, CallState::Pending | CallState::Escalated) {
            self.timers.cancel_session(&current.id);
        }

        self.audit(&current.id, actor_id, action, detail).await;
        let _ = self.events.send(CallEvent::StateChanged {
            session_id: current.id.clone(),
            from: previous.state,
            to: current.state,
        });

        if previous.state == CallState::Pending {
            self.warned.remove(&current.id);
            if let Some(reader_id) = previous.reader_id.clone() {
                let payload = self.cleared_payload(current);
                let delivery = self.delivery.clone();
                tokio::spawn(async move {
                    delivery.notify_quietly(AlertTarget::Reader(reader_id), payload).await;
                });
            }
        }

        if previous.state == CallState::Escalated {
            let payload = self.cleared_payload(current);
            let delivery = self.delivery.clone();
            tokio::spawn(async move {
                delivery.push_to_staff(payload).await;
            });
        }
    }

    async fn audit(&self, session_id: &SessionId, actor_id: Option<UserId>, action: AuditAction, detail: Option<String>) {
        let entry = AuditEntry::new(session_id.clone(), actor_id, action, detail, self.clock.now());
        if let Err(e) = self.store.append_audit(entry).await {
            error!("Failed to audit {:?} on session {}: {}", action, session_id, e);
        }
    }

    async fn pick_available_reader(&self) -> Result<Option<UserId>> {
        let readers = self.directory.available_readers().await?;
        Ok(readers.into_iter().next().map(|r| r.id))
    }

    fn incoming_payload(&self, session: &CallSession) -> AlertPayload {
        let emergency = session.is_emergency();
        AlertPayload {
            session_id: session.id.clone(),
            kind: if emergency {
                NotificationKind::IncomingEmergency
            } else {
                NotificationKind::IncomingCall
            },
            call_kind: session.kind,
            channel: session.channel,
            declinable: !emergency,
            audible: emergency.then_some(AudibleDirective {
                repeat_every_secs: self.config.audible_repeat_secs,
                until_session_leaves_pending: true,
            }),
            message: if emergency {
                format!("Emergency {:?} request from {}", session.channel, session.client_id)
            } else {
                format!("Incoming {:?} request from {}", session.channel, session.client_id)
            },
        }
    }

    fn cleared_payload(&self, session: &CallSession) -> AlertPayload {
        AlertPayload {
            session_id: session.id.clone(),
            kind: NotificationKind::AlertCleared,
            call_kind: session.kind,
            channel: session.channel,
            declinable: false,
            audible: None,
            message: format!("Session {} is now {}", session.id, session.state),
        }
    }
}

fn transition(session: &CallSession, action: CallAction) -> Result<CallState> {
    next_state(session.kind, session.state, action).ok_or_else(|| CallwatchError::InvalidTransition {
        session_id: session.id.clone(),
        from: session.state,
        action: action.name(),
    })
}

fn to_chrono(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::zero())
}

/// Routes timer callbacks back into the machine without keeping it alive
struct TimerRelay {
    machine: Weak<CallStateMachine>,
}

#[async_trait]
impl TimerListener for TimerRelay {
    async fn on_warning(&self, session_id: &SessionId, kind: TimerKind) {
        if kind != TimerKind::Response {
            return;
        }
        if let Some(machine) = self.machine.upgrade() {
            machine.on_warning(session_id).await;
        }
    }

    async fn on_expired(&self, session_id: &SessionId, kind: TimerKind) {
        let Some(machine) = self.machine.upgrade() else {
            return;
        };
        let result = match kind {
            TimerKind::Response => machine.on_timer_expired(session_id).await,
            TimerKind::ClaimWindow => machine.expire_escalated(session_id).await,
        };
        match result {
            Ok(_) => {}
            Err(CallwatchError::InvalidTransition { from, .. }) => {
                debug!("{:?} timer for {} fired in state {}, ignored", kind, session_id, from);
            }
            Err(e) => error!("{:?} timer for {} failed: {}", kind, session_id, e),
        }
    }
}
