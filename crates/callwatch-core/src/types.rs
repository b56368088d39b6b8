//! Core types for callwatch-core
//!
//! Identifiers, the persisted call session record, escalation records,
//! monitoring alerts and the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// User identifier from the user directory
pub type UserId = String;

/// Session ID type
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Monitoring alert ID type
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub String);

impl AlertId {
    pub fn new() -> Self {
        Self(format!("alert-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AlertId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether the call may be declined and carries an escalation deadline
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Regular,
    Emergency,
}

/// Transport of the session
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Voice,
    Video,
    Chat,
}

impl Channel {
    pub fn is_chat(&self) -> bool {
        matches!(self, Channel::Chat)
    }
}

/// Lifecycle state of a call session
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    Active,
    Declined,
    Escalated,
    Expired,
    Stopped,
}

impl CallState {
    /// Declined, expired and stopped sessions never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Declined | CallState::Expired | CallState::Stopped)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Pending => "pending",
            CallState::Active => "active",
            CallState::Declined => "declined",
            CallState::Escalated => "escalated",
            CallState::Expired => "expired",
            CallState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A call or chat session as persisted by the session store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: SessionId,
    pub client_id: UserId,
    /// Target reader, `None` until one is assigned
    pub reader_id: Option<UserId>,
    /// Who actually answered (reader or staff after escalation)
    pub responder_id: Option<UserId>,
    pub kind: CallKind,
    pub channel: Channel,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub escalation_deadline: Option<DateTime<Utc>>,
    /// Set when a required notification could not be delivered
    pub delivery_failed: bool,
    /// Store revision, bumped on every successful update
    pub version: u64,
}

impl CallSession {
    pub fn new(
        client_id: impl Into<UserId>,
        reader_id: Option<UserId>,
        kind: CallKind,
        channel: Channel,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            client_id: client_id.into(),
            reader_id,
            responder_id: None,
            kind,
            channel,
            state: CallState::Pending,
            created_at,
            responded_at: None,
            ended_at: None,
            escalation_deadline: None,
            delivery_failed: false,
            version: 0,
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.kind == CallKind::Emergency
    }
}

/// Why a session was escalated
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    NoAnswer,
    Manual,
}

/// Append-only record of one escalation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub session_id: SessionId,
    pub escalated_from: Option<UserId>,
    /// Write-once: filled when staff claims the escalation
    pub escalated_to: Option<UserId>,
    pub reason: EscalationReason,
    pub auto_escalated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Who raised a monitoring alert
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    Ai,
    Monitor,
    System,
}

/// Alert against a live session, resolved by a supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringAlert {
    pub id: AlertId,
    pub session_id: SessionId,
    pub severity: Severity,
    pub alert_type: String,
    /// 0..=100
    pub confidence: u8,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub source: AlertSource,
    pub raised_by: Option<UserId>,
    pub reason: Option<String>,
    pub resolved_by: Option<UserId>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl MonitoringAlert {
    /// Alert produced by the AI classifier
    pub fn from_ai(
        session_id: SessionId,
        severity: Severity,
        alert_type: impl Into<String>,
        confidence: u8,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            session_id,
            severity,
            alert_type: alert_type.into(),
            confidence: confidence.min(100),
            resolved: false,
            created_at,
            source: AlertSource::Ai,
            raised_by: None,
            reason: None,
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Alert raised by a supervisor flag
    pub fn from_monitor(
        session_id: SessionId,
        actor_id: impl Into<UserId>,
        reason: impl Into<String>,
        severity: Severity,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            session_id,
            severity,
            alert_type: "monitor_flag".to_string(),
            confidence: 100,
            resolved: false,
            created_at,
            source: AlertSource::Monitor,
            raised_by: Some(actor_id.into()),
            reason: Some(reason.into()),
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Alert raised by the core itself, e.g. an undeliverable escalation
    pub fn from_system(
        session_id: SessionId,
        alert_type: impl Into<String>,
        reason: impl Into<String>,
        severity: Severity,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            session_id,
            severity,
            alert_type: alert_type.into(),
            confidence: 100,
            resolved: false,
            created_at,
            source: AlertSource::System,
            raised_by: None,
            reason: Some(reason.into()),
            resolved_by: None,
            resolved_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Accepted,
    Declined,
    Escalated,
    Expired,
    Stopped,
    MonitorJoined,
    Flagged,
    AlertResolved,
    DeliveryFailed,
}

/// Append-only audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub session_id: SessionId,
    pub actor_id: Option<UserId>,
    pub action: AuditAction,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        session_id: SessionId,
        actor_id: Option<UserId>,
        action: AuditAction,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("audit-{}", Uuid::new_v4()),
            session_id,
            actor_id,
            action,
            detail,
            at,
        }
    }
}
