//! Session risk scoring
//!
//! Pure mapping from a session's flag vector to a numeric score and a coarse
//! tag. Weights are additive and capped at [`MAX_RISK_SCORE`]; the tag follows
//! a fixed priority order with emergency first.

use serde::{Deserialize, Serialize};

use crate::types::{AlertSource, CallSession, MonitoringAlert};

pub const AI_FLAG_WEIGHT: u8 = 30;
pub const MONITOR_FLAG_WEIGHT: u8 = 40;
pub const EMERGENCY_FLAG_WEIGHT: u8 = 50;
pub const MAX_RISK_SCORE: u8 = 100;

/// Coarse risk label shown to supervisors
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTag {
    Safe,
    NeedsReview,
    Suspicious,
    Critical,
}

/// Flag vector the score is computed from
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionFlags {
    pub ai_flagged: bool,
    pub monitor_flagged: bool,
    pub emergency_flagged: bool,
}

impl SessionFlags {
    /// Derive flags from a session and its alerts. Resolved alerts no longer count.
    pub fn derive<'a>(
        session: &CallSession,
        alerts: impl IntoIterator<Item = &'a MonitoringAlert>,
    ) -> Self {
        let mut flags = SessionFlags {
            emergency_flagged: session.is_emergency(),
            ..Default::default()
        };

        for alert in alerts {
            if alert.resolved || alert.session_id != session.id {
                continue;
            }
            match alert.source {
                AlertSource::Ai => flags.ai_flagged = true,
                AlertSource::Monitor => flags.monitor_flagged = true,
                AlertSource::System => {}
            }
        }

        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: u8,
    pub tag: RiskTag,
}

/// Score a flag vector. Deterministic and side-effect-free.
pub fn score(flags: &SessionFlags) -> RiskAssessment {
    let mut total: u16 = 0;
    if flags.ai_flagged {
        total += AI_FLAG_WEIGHT as u16;
    }
    if flags.monitor_flagged {
        total += MONITOR_FLAG_WEIGHT as u16;
    }
    if flags.emergency_flagged {
        total += EMERGENCY_FLAG_WEIGHT as u16;
    }

    let tag = if flags.emergency_flagged {
        RiskTag::Critical
    } else if flags.monitor_flagged {
        RiskTag::Suspicious
    } else if flags.ai_flagged {
        RiskTag::NeedsReview
    } else {
        RiskTag::Safe
    };

    RiskAssessment {
        risk_score: total.min(MAX_RISK_SCORE as u16) as u8,
        tag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallKind, Channel, Severity};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn flags(ai: bool, monitor: bool, emergency: bool) -> SessionFlags {
        SessionFlags {
            ai_flagged: ai,
            monitor_flagged: monitor,
            emergency_flagged: emergency,
        }
    }

    #[test]
    fn test_all_flag_combinations() {
        let table = [
            (flags(false, false, false), 0, RiskTag::Safe),
            (flags(true, false, false), 30, RiskTag::NeedsReview),
            (flags(false, true, false), 40, RiskTag::Suspicious),
            (flags(true, true, false), 70, RiskTag::Suspicious),
            (flags(false, false, true), 50, RiskTag::Critical),
            (flags(true, false, true), 80, RiskTag::Critical),
            (flags(false, true, true), 90, RiskTag::Critical),
            (flags(true, true, true), 100, RiskTag::Critical),
        ];

        for (input, expected_score, expected_tag) in table {
            let first = score(&input);
            let second = score(&input);
            assert_eq!(first, second, "scoring must be deterministic for {:?}", input);
            assert_eq!(first.risk_score, expected_score, "score for {:?}", input);
            assert_eq!(first.tag, expected_tag, "tag for {:?}", input);
        }
    }

    #[test]
    fn test_derive_ignores_resolved_and_foreign_alerts() {
        let session = crate::types::CallSession::new("client", None, CallKind::Regular, Channel::Chat, Utc::now());

        let mut resolved_ai = MonitoringAlert::from_ai(session.id.clone(), Severity::High, "abuse", 90, Utc::now());
        resolved_ai.resolved = true;
        let other_session = MonitoringAlert::from_monitor("other".into(), "mon-1", "spam", Severity::Low, Utc::now());
        let system = MonitoringAlert::from_system(session.id.clone(), "delivery_failed", "no staff", Severity::Critical, Utc::now());

        let derived = SessionFlags::derive(&session, [&resolved_ai, &other_session, &system]);
        assert_eq!(derived, SessionFlags::default());
    }

    #[test]
    fn test_ai_and_monitor_flags_score_seventy() {
        let session = crate::types::CallSession::new("client", Some("reader".into()), CallKind::Regular, Channel::Voice, Utc::now());
        let ai = MonitoringAlert::from_ai(session.id.clone(), Severity::Medium, "harassment", 80, Utc::now());
        let monitor = MonitoringAlert::from_monitor(session.id.clone(), "mon-1", "rude", Severity::Medium, Utc::now());

        let assessment = score(&SessionFlags::derive(&session, [&ai, &monitor]));
        assert_eq!(assessment, RiskAssessment { risk_score: 70, tag: RiskTag::Suspicious });
    }
}
