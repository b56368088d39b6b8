//! Shared harness for callwatch-core integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callwatch_core::config::DeliveryConfig;
use callwatch_core::store::StoreChange;
use callwatch_core::{
    AlertId, AlertPayload, AlertTarget, AuditEntry, CallKind, CallSession, CallState, CallStateMachine,
    CallwatchConfig, CallwatchError, Callwatch, Channel, EscalationRecord, InMemorySessionStore,
    InMemoryUserDirectory, ManualClock, MonitoringAlert, NotificationDispatcher, NotificationKind, Result,
    SessionId, SessionStore, UserId, UserProfile, UserRole,
};
use tokio::sync::broadcast;

pub const READER: &str = "reader-1";
pub const OTHER_READER: &str = "reader-2";
pub const ADMIN: &str = "admin-1";
pub const MONITOR: &str = "monitor-1";
pub const CLIENT: &str = "client-1";

#[derive(Debug, Clone)]
pub struct Delivered {
    pub target: AlertTarget,
    pub payload: AlertPayload,
    pub repeat: bool,
}

/// Dispatcher that records every delivery and can be told to fail
#[derive(Default)]
pub struct RecordingDispatcher {
    delivered: Mutex<Vec<Delivered>>,
    failing: Mutex<Vec<UserId>>,
    fail_everything: AtomicBool,
    attempts: AtomicUsize,
    loads: Mutex<HashMap<UserId, u32>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let dispatcher = Self::default();
        dispatcher.fail_everything.store(true, Ordering::SeqCst);
        Arc::new(dispatcher)
    }

    pub fn fail_for(&self, user_id: &str) {
        self.failing.lock().push(user_id.to_string());
    }

    pub fn set_load(&self, user_id: &str, load: u32) {
        self.loads.lock().insert(user_id.to_string(), load);
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().clone()
    }

    pub fn delivered_to(&self, user_id: &str) -> Vec<Delivered> {
        self.delivered()
            .into_iter()
            .filter(|d| d.target.user_id() == user_id)
            .collect()
    }

    pub fn of_kind(&self, pred: impl Fn(&NotificationKind) -> bool) -> Vec<Delivered> {
        self.delivered().into_iter().filter(|d| pred(&d.payload.kind)).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn alert(&self, target: &AlertTarget, payload: &AlertPayload, repeat: bool) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_everything.load(Ordering::SeqCst) || self.failing.lock().contains(target.user_id()) {
            return Err(CallwatchError::Dispatch(format!("{} unreachable", target)));
        }
        self.delivered.lock().push(Delivered {
            target: target.clone(),
            payload: payload.clone(),
            repeat,
        });
        Ok(())
    }

    async fn current_load(&self, staff_id: &UserId) -> Option<u32> {
        self.loads.lock().get(staff_id).copied()
    }
}

/// In-memory store that can refuse escalation records or every session update
pub struct FaultyStore {
    inner: Arc<InMemorySessionStore>,
    fail_escalations: AtomicBool,
    conflict_updates: AtomicBool,
    update_attempts: AtomicUsize,
}

impl FaultyStore {
    pub fn wrap(inner: Arc<InMemorySessionStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_escalations: AtomicBool::new(false),
            conflict_updates: AtomicBool::new(false),
            update_attempts: AtomicUsize::new(0),
        })
    }

    pub fn fail_escalations(&self) {
        self.fail_escalations.store(true, Ordering::SeqCst);
    }

    pub fn conflict_updates(&self) {
        self.conflict_updates.store(true, Ordering::SeqCst);
    }

    pub fn update_attempts(&self) -> usize {
        self.update_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for FaultyStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<CallSession>> {
        self.inner.get(session_id).await
    }

    async fn create(&self, session: CallSession) -> Result<CallSession> {
        self.inner.create(session).await
    }

    async fn update(&self, session: CallSession, expected_version: u64) -> Result<CallSession> {
        self.update_attempts.fetch_add(1, Ordering::SeqCst);
        if self.conflict_updates.load(Ordering::SeqCst) {
            return Err(CallwatchError::StoreConflict {
                session_id: session.id,
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        self.inner.update(session, expected_version).await
    }

    async fn list_sessions(&self) -> Result<Vec<CallSession>> {
        self.inner.list_sessions().await
    }

    async fn append_escalation(&self, record: EscalationRecord) -> Result<()> {
        if self.fail_escalations.load(Ordering::SeqCst) {
            return Err(CallwatchError::Store("escalation table unavailable".into()));
        }
        self.inner.append_escalation(record).await
    }

    async fn claim_escalation(&self, session_id: &SessionId, staff_id: &UserId) -> Result<bool> {
        self.inner.claim_escalation(session_id, staff_id).await
    }

    async fn list_escalations(&self, session_id: &SessionId) -> Result<Vec<EscalationRecord>> {
        self.inner.list_escalations(session_id).await
    }

    async fn create_alert(&self, alert: MonitoringAlert) -> Result<MonitoringAlert> {
        self.inner.create_alert(alert).await
    }

    async fn get_alert(&self, alert_id: &AlertId) -> Result<Option<MonitoringAlert>> {
        self.inner.get_alert(alert_id).await
    }

    async fn resolve_alert(&self, alert_id: &AlertId, actor_id: &UserId, at: DateTime<Utc>) -> Result<MonitoringAlert> {
        self.inner.resolve_alert(alert_id, actor_id, at).await
    }

    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<MonitoringAlert>> {
        self.inner.list_alerts(unresolved_only).await
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.inner.append_audit(entry).await
    }

    async fn list_audit(&self, session_id: &SessionId) -> Result<Vec<AuditEntry>> {
        self.inner.list_audit(session_id).await
    }

    async fn revision(&self) -> Result<u64> {
        self.inner.revision().await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StoreChange>> {
        self.inner.subscribe()
    }
}

pub struct Harness {
    pub clock: ManualClock,
    pub store: Arc<InMemorySessionStore>,
    pub directory: Arc<InMemoryUserDirectory>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub callwatch: Callwatch,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), RecordingDispatcher::new())
    }

    pub fn with(config: CallwatchConfig, dispatcher: Arc<RecordingDispatcher>) -> Self {
        Self::with_store(config, dispatcher, |store| store as Arc<dyn SessionStore>)
    }

    /// Wire the core to a wrapper around the harness store
    pub fn with_store<F>(config: CallwatchConfig, dispatcher: Arc<RecordingDispatcher>, wrap: F) -> Self
    where
        F: FnOnce(Arc<InMemorySessionStore>) -> Arc<dyn SessionStore>,
    {
        init_tracing();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let store = Arc::new(InMemorySessionStore::new());
        let directory = Arc::new(InMemoryUserDirectory::new(Arc::new(clock.clone()), Duration::from_secs(90)));

        for (id, role) in [
            (CLIENT, UserRole::Client),
            (READER, UserRole::Reader),
            (OTHER_READER, UserRole::Reader),
            (ADMIN, UserRole::Admin),
            (MONITOR, UserRole::Monitor),
        ] {
            directory.upsert(UserProfile {
                id: id.to_string(),
                display_name: Some(id.replace('-', " ")),
                role,
            });
        }
        directory.heartbeat(&READER.to_string(), false);

        let callwatch = Callwatch::new(
            config,
            wrap(store.clone()),
            directory.clone(),
            dispatcher.clone(),
            Arc::new(clock.clone()),
        );

        Self {
            clock,
            store,
            directory,
            dispatcher,
            callwatch,
        }
    }

    pub fn machine(&self) -> &Arc<CallStateMachine> {
        &self.callwatch.machine
    }

    pub async fn emergency(&self) -> CallSession {
        self.machine()
            .create(CLIENT, CallKind::Emergency, Channel::Voice, Some(READER.to_string()))
            .await
            .unwrap()
    }

    pub async fn regular(&self, channel: Channel) -> CallSession {
        self.machine()
            .create(CLIENT, CallKind::Regular, channel, Some(READER.to_string()))
            .await
            .unwrap()
    }

    pub async fn state_of(&self, id: &SessionId) -> CallState {
        self.machine().get(id).await.unwrap().state
    }

    /// Move the fake clock and let timer and delivery tasks run
    pub async fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
        settle().await;
    }
}

/// Fast retries so exhausted delivery finishes quickly
pub fn test_config() -> CallwatchConfig {
    let mut config = CallwatchConfig::default();
    config.delivery = DeliveryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    };
    config
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("callwatch_core=debug")
        .with_test_writer()
        .try_init();
}

pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}
