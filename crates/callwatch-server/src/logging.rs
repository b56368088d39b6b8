//! Tracing subscriber setup

use anyhow::{anyhow, Result};
use callwatch_core::config::LoggingSettings;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` directives win over `level`.
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let level = parse_log_level(&settings.level)?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let mut subscriber = fmt::Subscriber::builder().with_env_filter(filter);

    if settings.file_info {
        subscriber = subscriber.with_file(true).with_line_number(true);
    }

    let installed = if settings.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| anyhow!("invalid log level: {}", level))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("Starting {} v{}", app_name, version);
}
