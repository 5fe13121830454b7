//! Follower storage
//!
//! The inbox records who follows the local actor through [`FollowerStore`].
//! The in-memory store is volatile and cleared on restart.

use std::collections::BTreeMap;

use axum::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::metrics::FOLLOWERS_TOTAL;

/// A remote actor following the local actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follower {
    pub actor_id: String,
    pub inbox: String,
    pub followed_at: DateTime<Utc>,
}

#[async_trait]
pub trait FollowerStore: Send + Sync {
    /// Record a follower. Returns `false` if it was already recorded.
    async fn add(&self, actor_id: &str, inbox: &str) -> Result<bool, AppError>;

    /// All followers ordered by actor id
    async fn list(&self) -> Result<Vec<Follower>, AppError>;

    async fn contains(&self, actor_id: &str) -> Result<bool, AppError>;

    async fn count(&self) -> Result<usize, AppError>;
}

/// Follower store backed by a map
#[derive(Default)]
pub struct InMemoryFollowerStore {
    followers: RwLock<BTreeMap<String, Follower>>,
}

impl InMemoryFollowerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FollowerStore for InMemoryFollowerStore {
    async fn add(&self, actor_id: &str, inbox: &str) -> Result<bool, AppError> {
        let mut followers = self.followers.write().await;
        if followers.contains_key(actor_id) {
            return Ok(false);
        }

        followers.insert(
            actor_id.to_string(),
            Follower {
                actor_id: actor_id.to_string(),
                inbox: inbox.to_string(),
                followed_at: Utc::now(),
            },
        );
        FOLLOWERS_TOTAL.set(followers.len() as i64);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Follower>, AppError> {
        Ok(self.followers.read().await.values().cloned().collect())
    }

    async fn contains(&self, actor_id: &str) -> Result<bool, AppError> {
        Ok(self.followers.read().await.contains_key(actor_id))
    }

    async fn count(&self) -> Result<usize, AppError> {
        Ok(self.followers.read().await.len())
    }
}
