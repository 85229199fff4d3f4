use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    db::KeyValueStore,
    domain::{item::MAX_QUEUE_SIZE, platform, QueueItem, QueueStatus},
};

use super::error::QueueError;

const QUEUE_KEY: &str = "share_queue.items";

/// Persists the share queue as one JSON document in the key-value store.
///
/// Every read-modify-write cycle runs under `write_lock`, so two callers can
/// never interleave a load and a save.
pub struct QueueStore {
    kv: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl QueueStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    pub fn is_supported_url(url: &str) -> bool {
        platform::is_supported_url(url)
    }

    /// Returns the persisted items minus anything past the TTL.
    pub async fn load(&self) -> Result<Vec<QueueItem>, QueueError> {
        let _guard = self.write_lock.lock().await;
        self.load_unlocked(Utc::now()).await
    }

    pub async fn save(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        self.save_unlocked(items).await
    }

    pub async fn add_item(
        &self,
        url: &str,
        title: Option<String>,
    ) -> Result<QueueItem, QueueError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(QueueError::Validation("URL is empty".into()));
        }
        if !Self::is_supported_url(url) {
            return Err(QueueError::Validation(format!("unsupported URL: {url}")));
        }

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut items = self.load_unlocked(now).await?;
        if items.iter().any(|item| item.url == url) {
            return Err(QueueError::Duplicate(url.to_string()));
        }
        if items.len() >= MAX_QUEUE_SIZE {
            return Err(QueueError::Capacity {
                capacity: MAX_QUEUE_SIZE,
            });
        }

        let title = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        let item = QueueItem::new(Uuid::new_v4().to_string(), url.to_string(), title, now);
        items.push(item.clone());
        self.save_unlocked(&items).await?;

        tracing::debug!(target: "store", id = %item.id, url = %item.url, "queue item added");
        Ok(item)
    }

    /// Replaces the stored item with the same id. Returns `false`, writing
    /// nothing, when the id is not stored (never added, removed or expired).
    pub async fn update_item(&self, item: &QueueItem) -> Result<bool, QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.load_unlocked(Utc::now()).await?;
        let Some(slot) = items.iter_mut().find(|existing| existing.id == item.id) else {
            return Ok(false);
        };
        *slot = item.clone();
        self.save_unlocked(&items).await?;
        Ok(true)
    }

    pub async fn remove_item(&self, id: &str) -> Result<bool, QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.load_unlocked(Utc::now()).await?;
        let before = items.len();
        items.retain(|item| item.id != id);
        if items.len() == before {
            return Ok(false);
        }
        self.save_unlocked(&items).await?;
        Ok(true)
    }

    pub async fn clear_queue(&self) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        self.kv
            .remove(QUEUE_KEY)
            .await
            .map_err(QueueError::persistence)
    }

    /// Drops saved and ignored items, returning how many were removed.
    pub async fn cleanup_completed_items(&self) -> Result<usize, QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.load_unlocked(Utc::now()).await?;
        let before = items.len();
        items.retain(|item| !item.status().is_terminal());
        let removed = before - items.len();
        if removed > 0 {
            self.save_unlocked(&items).await?;
            tracing::info!(target: "store", removed, "finished items cleaned up");
        }
        Ok(removed)
    }

    async fn load_unlocked(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>, QueueError> {
        let Some(raw) = self.kv.get(QUEUE_KEY).await.map_err(QueueError::persistence)? else {
            return Ok(Vec::new());
        };

        let items: Vec<QueueItem> = match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(
                    target: "store",
                    error = %err,
                    "persisted queue is unreadable; starting with an empty queue"
                );
                return Ok(Vec::new());
            }
        };

        let (fresh, expired) = partition_expired(items, now);
        if expired > 0 {
            tracing::info!(target: "store", expired, "expired queue items pruned");
            self.save_unlocked(&fresh).await?;
        }
        Ok(fresh)
    }

    async fn save_unlocked(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        let kept = truncate_to_capacity(items);
        if kept.len() < items.len() {
            tracing::warn!(
                target: "store",
                dropped = items.len() - kept.len(),
                "queue over capacity; oldest items dropped"
            );
        }
        let raw = serde_json::to_string(kept).map_err(QueueError::persistence)?;
        self.kv
            .put(QUEUE_KEY, &raw)
            .await
            .map_err(QueueError::persistence)
    }
}

fn partition_expired(items: Vec<QueueItem>, now: DateTime<Utc>) -> (Vec<QueueItem>, usize) {
    let total = items.len();
    let fresh: Vec<QueueItem> = items
        .into_iter()
        .filter(|item| !item.is_expired(now))
        .collect();
    let expired = total - fresh.len();
    (fresh, expired)
}

/// Keeps the most recent `MAX_QUEUE_SIZE` items; the list is in insertion order.
fn truncate_to_capacity(items: &[QueueItem]) -> &[QueueItem] {
    let start = items.len().saturating_sub(MAX_QUEUE_SIZE);
    &items[start..]
}

pub(crate) fn count_status(items: &[QueueItem], status: QueueStatus) -> usize {
    items.iter().filter(|item| item.status() == status).count()
}
