//! Notification delivery
//!
//! [`NotificationDispatcher`] is the boundary to the external delivery
//! service (push, SMS, in-app ringing). [`DeliveryService`] wraps it with
//! retries, staff fan-out and delivery-failure reporting so that an
//! unreachable dispatcher is itself observable.

mod delivery;

pub use delivery::DeliveryService;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::error::Result;
use crate::types::{AlertId, CallKind, Channel, SessionId, Severity, UserId};

/// Recipient of a notification
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", content = "user_id", rename_all = "snake_case")]
pub enum AlertTarget {
    Reader(UserId),
    Staff(UserId),
}

impl AlertTarget {
    pub fn user_id(&self) -> &UserId {
        match self {
            AlertTarget::Reader(id) | AlertTarget::Staff(id) => id,
        }
    }
}

impl fmt::Display for AlertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertTarget::Reader(id) => write!(f, "reader:{}", id),
            AlertTarget::Staff(id) => write!(f, "staff:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    IncomingCall,
    /// Undeclinable: the recipient UI must not offer a decline action
    IncomingEmergency,
    ResponseWarning { remaining_secs: u64 },
    Escalation,
    /// Stop any repeating audible alert for the session
    AlertCleared,
    AiAlert { alert_id: AlertId, severity: Severity },
}

/// Repeating audible alert, kept alive until the session leaves `pending`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudibleDirective {
    pub repeat_every_secs: u64,
    pub until_session_leaves_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub session_id: SessionId,
    pub kind: NotificationKind,
    pub call_kind: CallKind,
    pub channel: Channel,
    pub declinable: bool,
    pub audible: Option<AudibleDirective>,
    pub message: String,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn alert(&self, target: &AlertTarget, payload: &AlertPayload, repeat: bool) -> Result<()>;

    /// Sessions the staff member is currently handling, if the service tracks it
    async fn current_load(&self, _staff_id: &UserId) -> Option<u32> {
        None
    }
}

/// Dispatcher that only logs, for deployments without a delivery service
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn alert(&self, target: &AlertTarget, payload: &AlertPayload, repeat: bool) -> Result<()> {
        info!(
            target_user = %target,
            session = %payload.session_id,
            kind = ?payload.kind,
            repeat,
            "📣 {}",
            payload.message
        );
        Ok(())
    }
}
