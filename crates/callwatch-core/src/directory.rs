//! User directory collaborator
//!
//! Lookup of clients, readers and staff plus a heartbeat-based presence
//! contract. A user who never sent a heartbeat has [`Presence::Unknown`];
//! presence is never guessed.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::DirectoryConfig;
use crate::error::Result;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Client,
    Reader,
    Admin,
    Monitor,
}

impl UserRole {
    /// Admins and monitors receive escalations
    pub fn is_staff(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Monitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: Option<String>,
    pub role: UserRole,
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Away,
    Offline,
    /// No heartbeat has ever been received
    Unknown,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, user_id: &UserId) -> Result<Option<UserProfile>>;

    async fn presence(&self, user_id: &UserId) -> Result<Presence>;

    /// Admins and monitors eligible for escalations
    async fn staff_pool(&self) -> Result<Vec<UserProfile>>;

    /// Readers currently reported online
    async fn available_readers(&self) -> Result<Vec<UserProfile>>;
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    at: DateTime<Utc>,
    away: bool,
}

/// In-memory directory fed by explicit heartbeats
#[derive(Clone)]
pub struct InMemoryUserDirectory {
    users: Arc<DashMap<UserId, UserProfile>>,
    heartbeats: Arc<DashMap<UserId, Heartbeat>>,
    presence_ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl InMemoryUserDirectory {
    pub fn new(clock: Arc<dyn Clock>, presence_ttl: Duration) -> Self {
        Self {
            users: Arc::new(DashMap::new()),
            heartbeats: Arc::new(DashMap::new()),
            presence_ttl: ChronoDuration::from_std(presence_ttl)
                .unwrap_or_else(|_| ChronoDuration::seconds(90)),
            clock,
        }
    }

    /// Build a directory from configured seed users
    pub fn from_config(clock: Arc<dyn Clock>, config: &DirectoryConfig) -> Self {
        let directory = Self::new(clock, Duration::from_secs(config.presence_ttl_secs));
        for seed in &config.users {
            directory.upsert(UserProfile {
                id: seed.id.clone(),
                display_name: seed.display_name.clone(),
                role: seed.role,
            });
        }
        directory
    }

    pub fn upsert(&self, profile: UserProfile) {
        self.users.insert(profile.id.clone(), profile);
    }

    /// Record a presence heartbeat
    pub fn heartbeat(&self, user_id: &UserId, away: bool) {
        self.heartbeats.insert(
            user_id.clone(),
            Heartbeat {
                at: self.clock.now(),
                away,
            },
        );
    }

    /// Explicit sign-off: the user is offline until the next heartbeat
    pub fn sign_off(&self, user_id: &UserId) {
        self.heartbeats.insert(
            user_id.clone(),
            Heartbeat {
                at: DateTime::<Utc>::MIN_UTC,
                away: false,
            },
        );
    }

    fn presence_of(&self, user_id: &UserId) -> Presence {
        match self.heartbeats.get(user_id) {
            None => Presence::Unknown,
            Some(hb) if self.clock.now() - hb.at > self.presence_ttl => Presence::Offline,
            Some(hb) if hb.away => Presence::Away,
            Some(_) => Presence::Online,
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn lookup(&self, user_id: &UserId) -> Result<Option<UserProfile>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn presence(&self, user_id: &UserId) -> Result<Presence> {
        Ok(self.presence_of(user_id))
    }

    async fn staff_pool(&self) -> Result<Vec<UserProfile>> {
        let mut staff: Vec<UserProfile> = self
            .users
            .iter()
            .filter(|u| u.role.is_staff())
            .map(|u| u.value().clone())
            .collect();
        staff.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(staff)
    }

    async fn available_readers(&self) -> Result<Vec<UserProfile>> {
        let mut readers: Vec<UserProfile> = self
            .users
            .iter()
            .filter(|u| u.role == UserRole::Reader && self.presence_of(&u.id) == Presence::Online)
            .map(|u| u.value().clone())
            .collect();
        readers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(readers)
    }
}
