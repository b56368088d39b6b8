use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::config::MonitoringConfig;
use crate::store::{SessionStore, StoreChange};
use crate::types::{AlertId, SessionId};

/// Something in the store changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Session(SessionId),
    Alert { alert_id: AlertId, session_id: SessionId },
    /// Changes were missed or cannot be itemised, rebuild everything
    Resync,
}

impl From<StoreChange> for ChangeEvent {
    fn from(change: StoreChange) -> Self {
        match change {
            StoreChange::Session(id) => ChangeEvent::Session(id),
            StoreChange::Alert { alert_id, session_id } => ChangeEvent::Alert { alert_id, session_id },
        }
    }
}

/// Source of store mutation notifications, push or poll
#[async_trait]
pub trait SessionChangeFeed: Send {
    /// Wait for the next change. `None` once the feed is closed for good.
    async fn next_change(&mut self) -> Option<ChangeEvent>;
}

/// Feed backed by the store's broadcast channel
pub struct PushFeed {
    rx: broadcast::Receiver<StoreChange>,
}

impl PushFeed {
    pub fn new(rx: broadcast::Receiver<StoreChange>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl SessionChangeFeed for PushFeed {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        match self.rx.recv().await {
            Ok(change) => Some(change.into()),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Change feed lagged by {} notifications, resyncing", skipped);
                Some(ChangeEvent::Resync)
            }
            Err(RecvError::Closed) => None,
        }
    }
}

/// Feed that polls the store revision counter
pub struct PollingFeed {
    store: Arc<dyn SessionStore>,
    interval: Duration,
    last_revision: Option<u64>,
}

impl PollingFeed {
    pub fn new(store: Arc<dyn SessionStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            last_revision: None,
        }
    }
}

#[async_trait]
impl SessionChangeFeed for PollingFeed {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        loop {
            tokio::time::sleep(self.interval).await;
            match self.store.revision().await {
                Ok(revision) if Some(revision) != self.last_revision => {
                    debug!("Store revision moved to {}", revision);
                    self.last_revision = Some(revision);
                    return Some(ChangeEvent::Resync);
                }
                Ok(_) => {}
                Err(e) => warn!("Polling store revision failed: {}", e),
            }
        }
    }
}

/// Push feed when the store supports it and polling was not requested
pub fn change_feed_for(store: Arc<dyn SessionStore>, config: &MonitoringConfig) -> Box<dyn SessionChangeFeed> {
    if !config.use_polling_feed {
        if let Some(rx) = store.subscribe() {
            return Box::new(PushFeed::new(rx));
        }
        debug!("Store has no push notifications, falling back to polling");
    }
    Box::new(PollingFeed::new(store, config.polling_interval()))
}
