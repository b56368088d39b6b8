//! Supervisor view and interventions

mod common;

use callwatch_core::dispatch::NotificationKind;
use callwatch_core::monitoring::ChannelAlertSource;
use callwatch_core::{
    AiClassification, AlertId, AuditAction, CallState, CallwatchError, Channel, RiskTag, SessionId,
    SessionStore, Severity,
};
use common::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn test_view_excludes_terminal_sessions() {
    let h = Harness::new();
    let live = h.emergency().await;
    let declined = h.regular(Channel::Voice).await;
    let stopped = h.regular(Channel::Chat).await;
    let cleaned_up = h.regular(Channel::Video).await;

    h.machine().decline(&declined.id, READER).await.unwrap();
    h.callwatch.actions.force_stop(&stopped.id, ADMIN, "abuse").await.unwrap();
    h.machine().stop(&cleaned_up.id, ADMIN, "cleanup").await.unwrap();

    let views = h.callwatch.aggregator.list_active().await.unwrap();
    let ids: Vec<SessionId> = views.iter().map(|v| v.session_id.clone()).collect();
    assert_eq!(ids, vec![live.id]);
    assert!(views.iter().all(|v| !v.state.is_terminal()));
}

#[tokio::test]
async fn test_ai_and_monitor_flag_make_session_suspicious() {
    let h = Harness::new();
    let session = h.regular(Channel::Chat).await;
    h.machine().accept(&session.id, READER).await.unwrap();

    h.callwatch
        .aggregator
        .ingest_ai_alert(AiClassification {
            session_id: session.id.clone(),
            severity: Severity::Medium,
            alert_type: "off_platform_payment".to_string(),
            confidence: 80,
        })
        .await
        .unwrap();
    h.callwatch
        .actions
        .flag(&session.id, MONITOR, "asking for bank details", Severity::High)
        .await
        .unwrap();

    let views = h.callwatch.aggregator.list_active().await.unwrap();
    assert_eq!(views[0].risk_score, 70);
    assert_eq!(views[0].session_tag, RiskTag::Suspicious);
    assert!(views[0].flags.ai_flagged && views[0].flags.monitor_flagged);
    assert_eq!(h.state_of(&session.id).await, CallState::Active);
}

#[tokio::test]
async fn test_identical_flags_are_merged() {
    let h = Harness::new();
    let session = h.regular(Channel::Voice).await;
    let actions = &h.callwatch.actions;

    let first = actions.flag(&session.id, MONITOR, "rude", Severity::Medium).await.unwrap();
    let second = actions.flag(&session.id, MONITOR, "rude", Severity::Medium).await.unwrap();
    assert_eq!(first.id, second.id);

    let different = actions.flag(&session.id, MONITOR, "rude", Severity::High).await.unwrap();
    assert_ne!(first.id, different.id);

    h.advance(61).await;
    let later = actions.flag(&session.id, MONITOR, "rude", Severity::Medium).await.unwrap();
    assert_ne!(first.id, later.id);
    assert_eq!(h.store.list_alerts(true).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_join_is_silent_and_deduplicated() {
    let h = Harness::new();
    let session = h.regular(Channel::Voice).await;
    let before = h.machine().get(&session.id).await.unwrap();

    let first = h.callwatch.actions.join(&session.id, ADMIN).await.unwrap();
    let again = h.callwatch.actions.join(&session.id, ADMIN).await.unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(first.action, AuditAction::MonitorJoined);

    let after = h.machine().get(&session.id).await.unwrap();
    assert_eq!(before, after);

    h.machine().stop(&session.id, ADMIN, "done").await.unwrap();
    let err = h.callwatch.actions.join(&session.id, MONITOR).await.unwrap_err();
    assert!(matches!(err, CallwatchError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_resolving_an_alert_lowers_the_score() {
    let h = Harness::new();
    let session = h.regular(Channel::Voice).await;
    let alert = h
        .callwatch
        .actions
        .flag(&session.id, MONITOR, "shouting", Severity::Low)
        .await
        .unwrap();
    assert_eq!(h.callwatch.aggregator.list_active().await.unwrap()[0].risk_score, 40);

    h.advance(30).await;
    let resolved = h.callwatch.actions.resolve_alert(&alert.id, ADMIN).await.unwrap();
    assert!(resolved.resolved);
    assert_eq!(resolved.resolved_by.as_deref(), Some(ADMIN));
    assert_eq!(resolved.resolved_at, Some(alert.created_at + chrono::Duration::seconds(30)));

    let view = &h.callwatch.aggregator.list_active().await.unwrap()[0];
    assert_eq!(view.risk_score, 0);
    assert_eq!(view.session_tag, RiskTag::Safe);
    assert!(h.callwatch.aggregator.list_alerts(true).await.unwrap().is_empty());

    let err = h
        .callwatch
        .actions
        .resolve_alert(&AlertId::from("alert-missing"), ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, CallwatchError::NotFound(_)));
}

#[tokio::test]
async fn test_high_severity_ai_alert_reaches_staff() {
    let h = Harness::new();
    let session = h.regular(Channel::Chat).await;
    let source = ChannelAlertSource::new();
    let ingest = h.callwatch.attach_alert_source(&source).await.unwrap();

    assert_eq!(
        source.publish(AiClassification {
            session_id: session.id.clone(),
            severity: Severity::Critical,
            alert_type: "self_harm".to_string(),
            confidence: 120,
        }),
        1
    );
    settle().await;

    let alerts = h.callwatch.aggregator.list_alerts(true).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].confidence, 100);

    let pushed = h.dispatcher.of_kind(|k| matches!(k, NotificationKind::AiAlert { .. }));
    let mut targets: Vec<_> = pushed.iter().map(|d| d.target.user_id().clone()).collect();
    targets.sort();
    assert_eq!(targets, vec![ADMIN.to_string(), MONITOR.to_string()]);

    h.callwatch.shutdown();
    tokio::time::timeout(Duration::from_secs(1), ingest).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_background_loop_publishes_views() {
    let h = Harness::new();
    let mut views = h.callwatch.aggregator.subscribe_views();
    let task = h.callwatch.start();

    let session = h.emergency().await;
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            views.changed().await.unwrap();
            if views.borrow().iter().any(|v| v.session_id == session.id) {
                break;
            }
        }
    })
    .await
    .unwrap();

    h.callwatch.shutdown();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}
