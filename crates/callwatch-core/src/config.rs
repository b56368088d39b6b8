//! Configuration for callwatch
//!
//! Defaults are layered under an optional TOML file and `CALLWATCH__*`
//! environment variables, e.g. `CALLWATCH__ESCALATION__RESPONSE_WINDOW_SECS=120`.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::directory::UserRole;
use crate::error::Result;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallwatchConfig {
    pub escalation: EscalationConfig,
    pub monitoring: MonitoringConfig,
    pub delivery: DeliveryConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub logging: LoggingSettings,
    pub directory: DirectoryConfig,
}

/// Response window and timer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// How long an emergency may stay unanswered before it escalates
    pub response_window_secs: u64,
    /// Lead time of the one-minute-remaining warning
    pub warning_lead_secs: u64,
    /// Ring timeout for regular calls, `None` disables it
    pub regular_ring_timeout_secs: Option<u64>,
    /// How long an escalated session waits for staff, `None` waits forever
    pub claim_window_secs: Option<u64>,
    /// Raise a monitoring alert when a regular call expires unanswered
    pub alert_on_regular_expiry: bool,
    /// Interval hint for the repeating audible directive
    pub audible_repeat_secs: u64,
}

impl EscalationConfig {
    pub fn response_window(&self) -> Duration {
        Duration::from_secs(self.response_window_secs)
    }

    pub fn warning_lead(&self) -> Duration {
        Duration::from_secs(self.warning_lead_secs)
    }

    pub fn regular_ring_timeout(&self) -> Option<Duration> {
        self.regular_ring_timeout_secs.map(Duration::from_secs)
    }

    pub fn claim_window(&self) -> Option<Duration> {
        self.claim_window_secs.map(Duration::from_secs)
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            response_window_secs: 300,
            warning_lead_secs: 60,
            regular_ring_timeout_secs: Some(120),
            claim_window_secs: None,
            alert_on_regular_expiry: false,
            audible_repeat_secs: 3,
        }
    }
}

/// Aggregator cadence and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub refresh_interval_secs: u64,
    /// Chat sessions older than this are dropped from the view
    pub chat_retention_secs: u64,
    /// Identical flags and repeated joins inside this window are merged
    pub flag_dedup_window_secs: u64,
    /// Use the polling change feed instead of store push notifications
    pub use_polling_feed: bool,
    pub polling_interval_secs: u64,
}

impl MonitoringConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn chat_retention(&self) -> Duration {
        Duration::from_secs(self.chat_retention_secs)
    }

    pub fn flag_dedup_window(&self) -> Duration {
        Duration::from_secs(self.flag_dedup_window_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs.max(1))
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 10,
            chat_retention_secs: 2 * 60 * 60,
            flag_dedup_window_secs: 60,
            use_polling_feed: false,
            polling_interval_secs: 5,
        }
    }
}

/// Retry behaviour for notification delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl DeliveryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Optimistic-concurrency retries before an operation reports `Busy`
    pub max_conflict_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { max_conflict_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8088".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
        }
    }
}

/// Seed data and presence rules for the in-memory user directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Heartbeats older than this count as offline
    pub presence_ttl_secs: u64,
    pub users: Vec<SeedUser>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            presence_ttl_secs: 90,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub display_name: Option<String>,
    pub role: UserRole,
}

impl CallwatchConfig {
    /// Load defaults, then the optional file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("CALLWATCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }
}
