//! Per-user dashboard statistics.
//!
//! Stats are kept in memory, keyed by user id. A user's record is created
//! with default values the first time it is read.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Initial project count for a new user.
pub const DEFAULT_PROJECT_COUNT: i64 = 3;

/// Initial activity count for a new user.
pub const DEFAULT_ACTIVITY_TODAY: i64 = 10;

/// Initial unread notification count for a new user.
pub const DEFAULT_NOTIFICATIONS: i64 = 2;

/// Dashboard counters for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: String,
    pub project_count: i64,
    pub activity_today: i64,
    pub notifications: i64,
    pub last_login: DateTime<Utc>,
    pub member_since: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserStats {
    fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            project_count: DEFAULT_PROJECT_COUNT,
            activity_today: DEFAULT_ACTIVITY_TODAY,
            notifications: DEFAULT_NOTIFICATIONS,
            last_login: now,
            member_since: now,
            updated_at: now,
        }
    }

    fn counter_mut(&mut self, field: StatField) -> &mut i64 {
        match field {
            StatField::Projects => &mut self.project_count,
            StatField::Activity => &mut self.activity_today,
            StatField::Notifications => &mut self.notifications,
        }
    }
}

/// A counter that can be adjusted through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatField {
    Projects,
    Activity,
    Notifications,
}

impl FromStr for StatField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "projects" => Ok(Self::Projects),
            "activity" => Ok(Self::Activity),
            "notifications" => Ok(Self::Notifications),
            other => Err(format!("unknown stats field '{other}'")),
        }
    }
}

impl fmt::Display for StatField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Projects => "projects",
            Self::Activity => "activity",
            Self::Notifications => "notifications",
        };
        f.write_str(name)
    }
}

/// Shared in-memory stats repository.
#[derive(Debug, Clone, Default)]
pub struct StatsStore {
    records: Arc<RwLock<HashMap<String, UserStats>>>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the user's stats, creating the default record if needed.
    pub async fn get_or_create(&self, user_id: &str) -> UserStats {
        if let Some(stats) = self.records.read().await.get(user_id) {
            return stats.clone();
        }

        self.records
            .write()
            .await
            .entry(user_id.to_string())
            .or_insert_with(|| UserStats::new(user_id))
            .clone()
    }

    /// Adds `delta` to one counter. The result never goes below zero.
    ///
    /// Creates the default record first if the user has none.
    pub async fn increment(&self, user_id: &str, field: StatField, delta: i64) -> UserStats {
        let mut records = self.records.write().await;
        let stats = records
            .entry(user_id.to_string())
            .or_insert_with(|| UserStats::new(user_id));

        let counter = stats.counter_mut(field);
        *counter = counter.saturating_add(delta).max(0);
        stats.updated_at = Utc::now();
        stats.clone()
    }

    /// Number of users with a stats record.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
