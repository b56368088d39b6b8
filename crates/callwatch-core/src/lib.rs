//! # Callwatch-Core
//!
//! Emergency call escalation and live session monitoring.
//!
//! This crate provides:
//! - A call state machine with an undeclinable, time-bounded response window
//!   for emergency calls
//! - Per-session escalation timers behind an injectable clock
//! - Automatic escalation of unanswered emergencies to the staff pool, with
//!   retried delivery and observable delivery failures
//! - A risk-scored, continuously refreshed view of every live call and chat
//! - Supervisor interventions: silent join, flag, forced stop
//!
//! ## Architecture
//!
//! The session store is the single source of truth and every transition is
//! a versioned compare-and-swap against it. The user directory and the
//! notification dispatcher are external collaborators reached through
//! traits, with in-memory and logging implementations for single-process
//! deployments and tests.

pub mod clock;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod monitoring;
pub mod risk;
pub mod state_machine;
pub mod store;
pub mod timer;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CallwatchConfig;
pub use directory::{InMemoryUserDirectory, Presence, UserDirectory, UserProfile, UserRole};
pub use dispatch::{AlertPayload, AlertTarget, NotificationDispatcher, NotificationKind, TracingDispatcher};
pub use error::{CallwatchError, Result};
pub use events::CallEvent;
pub use monitoring::{
    AiAlertSource, AiClassification, LiveMonitoringAggregator, MonitorActionHandler, MonitoringView,
};
pub use risk::{score, RiskAssessment, RiskTag, SessionFlags};
pub use state_machine::CallStateMachine;
pub use store::{InMemorySessionStore, SessionStore};
pub use types::{
    AlertId, AlertSource, AuditAction, AuditEntry, CallKind, CallSession, CallState, Channel, EscalationReason,
    EscalationRecord, MonitoringAlert, SessionId, Severity, UserId,
};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Fully wired call escalation and monitoring core
#[derive(Clone)]
pub struct Callwatch {
    pub machine: Arc<CallStateMachine>,
    pub aggregator: Arc<LiveMonitoringAggregator>,
    pub actions: Arc<MonitorActionHandler>,
    store: Arc<dyn SessionStore>,
    config: CallwatchConfig,
    shutdown: CancellationToken,
}

impl Callwatch {
    pub fn new(
        config: CallwatchConfig,
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn UserDirectory>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let machine = CallStateMachine::new(store.clone(), directory.clone(), dispatcher, clock.clone(), &config);
        let aggregator = LiveMonitoringAggregator::new(
            store.clone(),
            directory,
            machine.delivery().clone(),
            clock.clone(),
            config.monitoring.clone(),
        );
        let actions = Arc::new(MonitorActionHandler::new(machine.clone(), clock, &config.monitoring));

        Self {
            machine,
            aggregator,
            actions,
            store,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Everything in memory, with seed users from the config
    pub fn in_memory(config: CallwatchConfig, dispatcher: Arc<dyn NotificationDispatcher>, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(InMemorySessionStore::new());
        let directory = Arc::new(InMemoryUserDirectory::from_config(clock.clone(), &config.directory));
        Self::new(config, store, directory, dispatcher, clock)
    }

    pub fn config(&self) -> &CallwatchConfig {
        &self.config
    }

    /// Start the aggregation loop
    pub fn start(&self) -> JoinHandle<()> {
        let feed = monitoring::change_feed_for(self.store.clone(), &self.config.monitoring);
        info!("Starting callwatch monitoring");
        tokio::spawn(self.aggregator.clone().run(feed, self.shutdown.child_token()))
    }

    /// Subscribe the aggregator to an AI classifier
    pub async fn attach_alert_source(&self, source: &dyn AiAlertSource) -> Result<JoinHandle<()>> {
        self.aggregator
            .attach_alert_source(source, self.shutdown.child_token())
            .await
    }

    /// Stop background tasks and cancel every pending timer
    pub fn shutdown(&self) {
        info!("Shutting down callwatch");
        self.shutdown.cancel();
        self.machine.shutdown();
    }
}
