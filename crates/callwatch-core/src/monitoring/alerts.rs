use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{SessionId, Severity};

/// Raw output of the AI content classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiClassification {
    pub session_id: SessionId,
    pub severity: Severity,
    pub alert_type: String,
    /// Classifier confidence, clamped to 0..=100 on ingestion
    pub confidence: i32,
}

impl AiClassification {
    pub fn clamped_confidence(&self) -> u8 {
        self.confidence.clamp(0, 100) as u8
    }
}

/// Stream of AI classifications
#[async_trait]
pub trait AiAlertSource: Send + Sync {
    /// Register a sink. Classifications are sent to it until it is dropped.
    async fn subscribe(&self, sink: mpsc::UnboundedSender<AiClassification>) -> Result<()>;
}

/// In-process source fed through [`ChannelAlertSource::publish`]
#[derive(Default)]
pub struct ChannelAlertSource {
    sinks: Mutex<Vec<mpsc::UnboundedSender<AiClassification>>>,
}

impl ChannelAlertSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send to every live sink. Returns how many received it.
    pub fn publish(&self, classification: AiClassification) -> usize {
        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| !sink.is_closed());
        sinks
            .iter()
            .filter(|sink| sink.send(classification.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl AiAlertSource for ChannelAlertSource {
    async fn subscribe(&self, sink: mpsc::UnboundedSender<AiClassification>) -> Result<()> {
        self.sinks.lock().push(sink);
        Ok(())
    }
}
