//! Per-session escalation timers
//!
//! Each session owns at most one pending timer. A timer is a single-shot
//! deferred call into a [`TimerListener`], optionally preceded by a warning
//! callback. Cancellation and firing race on one atomic cell, so a timer
//! never fires after a successful [`EscalationTimers::cancel`] and a cancel
//! never succeeds once the firing path has claimed the timer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::error::{CallwatchError, Result};
use crate::types::SessionId;

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// What the timer guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Response window of a pending session
    Response,
    /// How long an escalated session waits to be claimed
    ClaimWindow,
}

/// Receiver of timer callbacks
#[async_trait]
pub trait TimerListener: Send + Sync {
    /// Called once at the warning instant if the timer is still pending
    async fn on_warning(&self, _session_id: &SessionId, _kind: TimerKind) {}

    async fn on_expired(&self, session_id: &SessionId, kind: TimerKind);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    AlreadyFired,
    NotScheduled,
}

/// Handle to a scheduled timer
#[derive(Debug, Clone)]
pub struct TimerHandle {
    session_id: SessionId,
    timer_id: u64,
    kind: TimerKind,
    deadline: DateTime<Utc>,
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

struct TimerSlot {
    timer_id: u64,
    kind: TimerKind,
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

/// Registry of per-session timers
pub struct EscalationTimers {
    clock: Arc<dyn Clock>,
    slots: Arc<DashMap<SessionId, TimerSlot>>,
    next_id: AtomicU64,
}

impl EscalationTimers {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Schedule a timer firing at `deadline`, with an optional warning at `warn_at`.
    ///
    /// Fails with `DuplicateTimer` if the session already has a pending timer.
    pub fn schedule(
        &self,
        session_id: SessionId,
        kind: TimerKind,
        deadline: DateTime<Utc>,
        warn_at: Option<DateTime<Utc>>,
        listener: Arc<dyn TimerListener>,
    ) -> Result<TimerHandle> {
        match self.slots.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                error!("Refusing to schedule second timer for session {}", session_id);
                Err(CallwatchError::DuplicateTimer(session_id))
            }
            Entry::Vacant(vacant) => {
                let timer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let state = Arc::new(AtomicU8::new(PENDING));

                let task = tokio::spawn(run_timer(
                    self.clock.clone(),
                    self.slots.clone(),
                    session_id.clone(),
                    timer_id,
                    kind,
                    deadline,
                    warn_at.filter(|w| *w < deadline),
                    state.clone(),
                    listener,
                ));

                vacant.insert(TimerSlot {
                    timer_id,
                    kind,
                    state: state.clone(),
                    task,
                });

                debug!("Scheduled {:?} timer {} for session {} at {}", kind, timer_id, session_id, deadline);

                Ok(TimerHandle {
                    session_id,
                    timer_id,
                    kind,
                    deadline,
                    state,
                })
            }
        }
    }

    /// Cancel the timer behind `handle`. Safe to call repeatedly and after expiry.
    pub fn cancel(&self, handle: &TimerHandle) -> CancelOutcome {
        let outcome = try_cancel(&handle.state);
        if outcome == CancelOutcome::Cancelled {
            if let Some((_, slot)) = self
                .slots
                .remove_if(&handle.session_id, |_, slot| slot.timer_id == handle.timer_id)
            {
                slot.task.abort();
            }
            debug!("Cancelled {:?} timer {} for session {}", handle.kind, handle.timer_id, handle.session_id);
        }
        outcome
    }

    /// Cancel whatever timer the session currently has
    pub fn cancel_session(&self, session_id: &SessionId) -> CancelOutcome {
        let (outcome, timer_id) = match self.slots.get(session_id) {
            None => return CancelOutcome::NotScheduled,
            Some(slot) => (try_cancel(&slot.state), slot.timer_id),
        };

        if outcome == CancelOutcome::Cancelled {
            if let Some((_, slot)) = self
                .slots
                .remove_if(session_id, |_, slot| slot.timer_id == timer_id)
            {
                debug!("Cancelled {:?} timer {} for session {}", slot.kind, timer_id, session_id);
                slot.task.abort();
            }
        }
        outcome
    }

    pub fn has_pending(&self, session_id: &SessionId) -> bool {
        self.slots
            .get(session_id)
            .map(|slot| slot.state.load(Ordering::Acquire) == PENDING)
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.slots.len()
    }

    /// Abort every timer, used on shutdown
    pub fn cancel_all(&self) {
        let ids: Vec<SessionId> = self.slots.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel_session(&id);
        }
    }
}

fn try_cancel(state: &AtomicU8) -> CancelOutcome {
    match state.compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => CancelOutcome::Cancelled,
        Err(CANCELLED) => CancelOutcome::AlreadyCancelled,
        Err(_) => CancelOutcome::AlreadyFired,
    }
}

async fn run_timer(
    clock: Arc<dyn Clock>,
    slots: Arc<DashMap<SessionId, TimerSlot>>,
    session_id: SessionId,
    timer_id: u64,
    kind: TimerKind,
    deadline: DateTime<Utc>,
    warn_at: Option<DateTime<Utc>>,
    state: Arc<AtomicU8>,
    listener: Arc<dyn TimerListener>,
) {
    if let Some(warn_at) = warn_at {
        clock.sleep_until(warn_at).await;
        if state.load(Ordering::Acquire) == PENDING {
            listener.on_warning(&session_id, kind).await;
        }
    }

    clock.sleep_until(deadline).await;

    if state
        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    slots.remove_if(&session_id, |_, slot| slot.timer_id == timer_id);
    debug!("{:?} timer {} fired for session {}", kind, timer_id, session_id);
    listener.on_expired(&session_id, kind).await;
}
