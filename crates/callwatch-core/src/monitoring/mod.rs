//! Live session monitoring
//!
//! The [`LiveMonitoringAggregator`] keeps a risk-sorted snapshot of every
//! live call and chat session, refreshed on a fixed cadence or as soon as
//! the [`SessionChangeFeed`] reports a store mutation. Supervisor
//! interventions go through the [`MonitorActionHandler`].

mod actions;
mod aggregator;
mod alerts;
mod feed;

pub use actions::MonitorActionHandler;
pub use aggregator::{LiveMonitoringAggregator, MonitoringView, ParticipantView, SessionType, ViewFlags};
pub use alerts::{AiAlertSource, AiClassification, ChannelAlertSource};
pub use feed::{change_feed_for, ChangeEvent, PollingFeed, PushFeed, SessionChangeFeed};
