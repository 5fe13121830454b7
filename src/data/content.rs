//! Received content
//!
//! Objects delivered to the inbox (Create payloads, bare Notes) are handed to
//! a [`ContentStore`]. The in-memory store is volatile and bounded.

use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde_json::Value;

use crate::error::AppError;

/// One object received from a remote actor
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedContent {
    /// Id of the activity that carried the object
    pub activity_id: String,
    pub actor: String,
    pub object: Value,
    pub received_at: DateTime<Utc>,
}

impl ReceivedContent {
    /// Id of the object itself, falling back to the activity id
    pub fn key(&self) -> &str {
        self.object
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(&self.activity_id)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn store(&self, content: ReceivedContent) -> Result<(), AppError>;
}

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Bounded content store (max `max_items`, 7 day TTL)
///
/// HTML in `content` is sanitized before it is kept.
pub struct InMemoryContentStore {
    items: Cache<String, Arc<ReceivedContent>>,
}

impl InMemoryContentStore {
    pub fn new(max_items: u64) -> Self {
        let items = Cache::builder()
            .max_capacity(max_items)
            .time_to_live(Duration::from_secs(3600 * 24 * 7))
            .build();
        Self { items }
    }

    pub async fn get(&self, object_id: &str) -> Option<Arc<ReceivedContent>> {
        self.items.get(object_id).await
    }

    pub async fn len(&self) -> u64 {
        self.items.run_pending_tasks().await;
        self.items.entry_count()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn store(&self, mut content: ReceivedContent) -> Result<(), AppError> {
        let clean = content
            .object
            .get("content")
            .and_then(Value::as_str)
            .map(sanitize_remote_html);
        if let Some(clean) = clean {
            content.object["content"] = Value::String(clean);
        }

        let key = content.key().to_string();
        tracing::debug!(object = %key, actor = %content.actor, "Stored received content");
        self.items.insert(key, Arc::new(content)).await;
        Ok(())
    }
}
