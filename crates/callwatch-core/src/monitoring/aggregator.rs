use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alerts::{AiAlertSource, AiClassification};
use super::feed::SessionChangeFeed;
use crate::clock::Clock;
use crate::config::MonitoringConfig;
use crate::directory::{Presence, UserDirectory, UserRole};
use crate::dispatch::{AlertPayload, DeliveryService, NotificationKind};
use crate::error::Result;
use crate::risk::{self, RiskTag, SessionFlags};
use crate::store::SessionStore;
use crate::types::{CallKind, CallSession, CallState, Channel, MonitoringAlert, SessionId, Severity, UserId};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Call,
    Chat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub user_id: UserId,
    pub display_name: Option<String>,
    /// `None` when the directory does not know the user
    pub role: Option<UserRole>,
    pub presence: Presence,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewFlags {
    pub ai_flagged: bool,
    pub monitor_flagged: bool,
    pub emergency_flagged: bool,
    pub delivery_failed: bool,
    pub unresolved_alerts: usize,
}

/// One row of the supervisor view, rebuilt on every pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringView {
    pub session_id: SessionId,
    pub session_type: SessionType,
    pub kind: CallKind,
    pub channel: Channel,
    pub state: CallState,
    pub session_tag: RiskTag,
    pub risk_score: u8,
    pub participants: Vec<ParticipantView>,
    pub duration_secs: u64,
    pub flags: ViewFlags,
    pub created_at: DateTime<Utc>,
}

/// Risk-sorted view over every live session
pub struct LiveMonitoringAggregator {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn UserDirectory>,
    delivery: Arc<DeliveryService>,
    clock: Arc<dyn Clock>,
    config: MonitoringConfig,
    snapshot: ArcSwap<Vec<MonitoringView>>,
    views_tx: watch::Sender<Arc<Vec<MonitoringView>>>,
}

impl LiveMonitoringAggregator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn UserDirectory>,
        delivery: Arc<DeliveryService>,
        clock: Arc<dyn Clock>,
        config: MonitoringConfig,
    ) -> Arc<Self> {
        let empty = Arc::new(Vec::new());
        let (views_tx, _) = watch::channel(empty.clone());
        Arc::new(Self {
            store,
            directory,
            delivery,
            clock,
            config,
            snapshot: ArcSwap::new(empty),
            views_tx,
        })
    }

    /// Rebuild the view from the store and return it
    pub async fn list_active(&self) -> Result<Vec<MonitoringView>> {
        let views = self.refresh().await?;
        Ok(views.as_ref().clone())
    }

    /// Last computed view without touching the store
    pub fn snapshot(&self) -> Arc<Vec<MonitoringView>> {
        self.snapshot.load_full()
    }

    pub fn subscribe_views(&self) -> watch::Receiver<Arc<Vec<MonitoringView>>> {
        self.views_tx.subscribe()
    }

    pub async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<MonitoringAlert>> {
        self.store.list_alerts(unresolved_only).await
    }

    /// One aggregation pass
    pub async fn refresh(&self) -> Result<Arc<Vec<MonitoringView>>> {
        let now = self.clock.now();
        let retention = ChronoDuration::from_std(self.config.chat_retention())
            .unwrap_or_else(|_| ChronoDuration::hours(2));

        let sessions = self.store.list_sessions().await?;
        let mut alerts_by_session: HashMap<SessionId, Vec<MonitoringAlert>> = HashMap::new();
        for alert in self.store.list_alerts(true).await? {
            alerts_by_session.entry(alert.session_id.clone()).or_default().push(alert);
        }

        let mut views = Vec::new();
        for session in sessions {
            if session.state.is_terminal() {
                continue;
            }
            if session.channel.is_chat() && now - session.created_at > retention {
                continue;
            }
            let alerts = alerts_by_session.get(&session.id).map(Vec::as_slice).unwrap_or(&[]);
            views.push(self.build_view(&session, alerts, now).await);
        }

        views.sort_by(|a, b| {
            b.risk_score
                .cmp(&a.risk_score)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.session_id.cmp(&b.session_id))
        });

        let views = Arc::new(views);
        self.snapshot.store(views.clone());
        self.views_tx.send_replace(views.clone());
        debug!("Monitoring view refreshed: {} live sessions", views.len());
        Ok(views)
    }

    async fn build_view(&self, session: &CallSession, alerts: &[MonitoringAlert], now: DateTime<Utc>) -> MonitoringView {
        let flags = SessionFlags::derive(session, alerts);
        let assessment = risk::score(&flags);

        let mut ids: Vec<&UserId> = vec![&session.client_id];
        ids.extend(session.reader_id.as_ref());
        ids.extend(session.responder_id.as_ref());

        let mut participants = Vec::with_capacity(ids.len());
        for id in ids {
            if participants.iter().any(|p: &ParticipantView| &p.user_id == id) {
                continue;
            }
            participants.push(self.participant(id).await);
        }

        MonitoringView {
            session_id: session.id.clone(),
            session_type: if session.channel.is_chat() {
                SessionType::Chat
            } else {
                SessionType::Call
            },
            kind: session.kind,
            channel: session.channel,
            state: session.state,
            session_tag: assessment.tag,
            risk_score: assessment.risk_score,
            participants,
            duration_secs: (now - session.created_at).num_seconds().max(0) as u64,
            flags: ViewFlags {
                ai_flagged: flags.ai_flagged,
                monitor_flagged: flags.monitor_flagged,
                emergency_flagged: flags.emergency_flagged,
                delivery_failed: session.delivery_failed,
                unresolved_alerts: alerts.len(),
            },
            created_at: session.created_at,
        }
    }

    async fn participant(&self, user_id: &UserId) -> ParticipantView {
        let profile = match self.directory.lookup(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Directory lookup for {} failed: {}", user_id, e);
                None
            }
        };
        let presence = self.directory.presence(user_id).await.unwrap_or_else(|e| {
            warn!("Presence lookup for {} failed: {}", user_id, e);
            Presence::Unknown
        });

        ParticipantView {
            user_id: user_id.clone(),
            display_name: profile.as_ref().and_then(|p| p.display_name.clone()),
            role: profile.map(|p| p.role),
            presence,
        }
    }

    /// Refresh on every tick and every change until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut feed: Box<dyn SessionChangeFeed>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        info!("Monitoring aggregator started (refresh every {:?})", self.config.refresh_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                change = feed.next_change(), if feed_open => match change {
                    Some(change) => debug!("Refreshing on {:?}", change),
                    None => {
                        warn!("Change feed closed, refreshing on the fixed cadence only");
                        feed_open = false;
                        continue;
                    }
                },
            }

            if let Err(e) = self.refresh().await {
                error!("Monitoring refresh failed: {}", e);
            }
        }
        info!("Monitoring aggregator stopped");
    }

    /// Subscribe to an AI alert source and ingest until `shutdown` fires
    pub async fn attach_alert_source(
        self: &Arc<Self>,
        source: &dyn AiAlertSource,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.subscribe(tx).await?;

        let aggregator = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(classification) => {
                            if let Err(e) = aggregator.ingest_ai_alert(classification).await {
                                error!("Failed to ingest AI alert: {}", e);
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("AI alert ingestion stopped");
        }))
    }

    /// Store one AI classification as an alert. Unknown sessions are dropped.
    pub async fn ingest_ai_alert(&self, classification: AiClassification) -> Result<Option<MonitoringAlert>> {
        let Some(session) = self.store.get(&classification.session_id).await? else {
            warn!("Dropping AI alert for unknown session {}", classification.session_id);
            return Ok(None);
        };

        let alert = MonitoringAlert::from_ai(
            session.id.clone(),
            classification.severity,
            classification.alert_type.clone(),
            classification.clamped_confidence(),
            self.clock.now(),
        );
        let alert = self.store.create_alert(alert).await?;
        info!(
            "🤖 AI alert {} on session {}: {} ({:?}, confidence {})",
            alert.id, alert.session_id, alert.alert_type, alert.severity, alert.confidence
        );

        if alert.severity >= Severity::High {
            let payload = AlertPayload {
                session_id: session.id.clone(),
                kind: NotificationKind::AiAlert {
                    alert_id: alert.id.clone(),
                    severity: alert.severity,
                },
                call_kind: session.kind,
                channel: session.channel,
                declinable: false,
                audible: None,
                message: format!("{:?} AI alert on session {}: {}", alert.severity, session.id, alert.alert_type),
            };
            let delivery = self.delivery.clone();
            tokio::spawn(async move {
                delivery.push_to_staff(payload).await;
            });
        }

        Ok(Some(alert))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DeliveryConfig;
    use crate::directory::{InMemoryUserDirectory, UserProfile};
    use crate::dispatch::TracingDispatcher;
    use crate::store::InMemorySessionStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Fixture {
        clock: ManualClock,
        store: Arc<InMemorySessionStore>,
        directory: Arc<InMemoryUserDirectory>,
        aggregator: Arc<LiveMonitoringAggregator>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemorySessionStore::new());
        let directory = Arc::new(InMemoryUserDirectory::new(shared_clock.clone(), Duration::from_secs(90)));
        let (events, _) = broadcast::channel(16);
        let delivery = Arc::new(DeliveryService::new(
            Arc::new(TracingDispatcher),
            directory.clone(),
            store.clone(),
            shared_clock.clone(),
            DeliveryConfig::default(),
            3,
            events,
        ));
        let aggregator = LiveMonitoringAggregator::new(
            store.clone(),
            directory.clone(),
            delivery,
            shared_clock,
            MonitoringConfig::default(),
        );
        Fixture {
            clock,
            store,
            directory,
            aggregator,
        }
    }

    async fn add_session(f: &Fixture, kind: CallKind, channel: Channel, state: CallState) -> CallSession {
        let mut session = CallSession::new("client-1", Some("reader-1".to_string()), kind, channel, f.clock.now());
        session.state = state;
        f.store.create(session).await.unwrap()
    }

    #[tokio::test]
    async fn test_terminal_sessions_are_hidden() {
        let f = fixture();
        let live = add_session(&f, CallKind::Regular, Channel::Voice, CallState::Active).await;
        for state in [CallState::Stopped, CallState::Declined, CallState::Expired] {
            add_session(&f, CallKind::Regular, Channel::Voice, state).await;
        }

        let views = f.aggregator.list_active().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].session_id, live.id);
    }

    #[tokio::test]
    async fn test_sorted_by_risk_then_age() {
        let f = fixture();
        let oldest_regular = add_session(&f, CallKind::Regular, Channel::Voice, CallState::Active).await;
        f.clock.advance(Duration::from_secs(5));
        let emergency = add_session(&f, CallKind::Emergency, Channel::Video, CallState::Pending).await;
        f.clock.advance(Duration::from_secs(5));
        let newer_regular = add_session(&f, CallKind::Regular, Channel::Chat, CallState::Active).await;

        let views = f.aggregator.list_active().await.unwrap();
        let order: Vec<_> = views.iter().map(|v| v.session_id.clone()).collect();
        assert_eq!(order, vec![emergency.id, oldest_regular.id, newer_regular.id]);
        assert_eq!(views[0].session_tag, RiskTag::Critical);
        assert_eq!(views[0].risk_score, 50);
        assert_eq!(views[2].session_type, SessionType::Chat);
    }

    #[tokio::test]
    async fn test_old_chats_drop_out_but_calls_stay() {
        let f = fixture();
        let call = add_session(&f, CallKind::Regular, Channel::Voice, CallState::Active).await;
        add_session(&f, CallKind::Regular, Channel::Chat, CallState::Active).await;

        f.clock.advance(Duration::from_secs(2 * 60 * 60 + 1));
        let views = f.aggregator.list_active().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].session_id, call.id);
        assert_eq!(views[0].duration_secs, 2 * 60 * 60 + 1);
    }

    #[tokio::test]
    async fn test_ai_and_monitor_flags_score_seventy() {
        let f = fixture();
        let session = add_session(&f, CallKind::Regular, Channel::Voice, CallState::Active).await;

        f.aggregator
            .ingest_ai_alert(AiClassification {
                session_id: session.id.clone(),
                severity: Severity::Medium,
                alert_type: "harassment".to_string(),
                confidence: 80,
            })
            .await
            .unwrap()
            .unwrap();
        f.store
            .create_alert(MonitoringAlert::from_monitor(
                session.id.clone(),
                "monitor-1",
                "abusive",
                Severity::Medium,
                f.clock.now(),
            ))
            .await
            .unwrap();

        let views = f.aggregator.list_active().await.unwrap();
        assert_eq!(views[0].risk_score, 70);
        assert_eq!(views[0].session_tag, RiskTag::Suspicious);
        assert_eq!(views[0].flags.unresolved_alerts, 2);
    }

    #[tokio::test]
    async fn test_ai_alert_for_unknown_session_is_dropped() {
        let f = fixture();
        let ingested = f
            .aggregator
            .ingest_ai_alert(AiClassification {
                session_id: SessionId::from("missing"),
                severity: Severity::High,
                alert_type: "fraud".to_string(),
                confidence: 140,
            })
            .await
            .unwrap();
        assert!(ingested.is_none());
        assert!(f.store.list_alerts(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_participants_carry_directory_presence() {
        let f = fixture();
        f.directory.upsert(UserProfile {
            id: "reader-1".to_string(),
            display_name: Some("Ada".to_string()),
            role: UserRole::Reader,
        });
        f.directory.heartbeat(&"reader-1".to_string(), false);
        add_session(&f, CallKind::Regular, Channel::Voice, CallState::Active).await;

        let views = f.aggregator.list_active().await.unwrap();
        let participants = &views[0].participants;
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[0].user_id, "client-1");
        assert_eq!(participants[0].presence, Presence::Unknown);
        assert_eq!(participants[0].role, None);
        assert_eq!(participants[1].display_name.as_deref(), Some("Ada"));
        assert_eq!(participants[1].presence, Presence::Online);
    }

    #[tokio::test]
    async fn test_run_refreshes_on_change_and_stops_on_cancel() {
        let f = fixture();
        let mut views = f.aggregator.subscribe_views();
        let feed = crate::monitoring::PushFeed::new(f.store.subscribe().unwrap());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.aggregator.clone().run(Box::new(feed), shutdown.clone()));

        add_session(&f, CallKind::Emergency, Channel::Voice, CallState::Pending).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                views.changed().await.unwrap();
                if views.borrow().len() == 1 {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(f.aggregator.snapshot().len(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
