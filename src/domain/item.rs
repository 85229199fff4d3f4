use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::platform::Platform;

/// Hard cap on the number of persisted queue items.
pub const MAX_QUEUE_SIZE: usize = 20;
/// Items shared longer ago than this are dropped on load.
pub const ITEM_TTL_DAYS: i64 = 7;
/// Failed items stop being picked up automatically after this many attempts.
pub const MAX_RETRY_COUNT: u32 = 3;
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.7;

pub fn item_ttl() -> Duration {
    Duration::days(ITEM_TTL_DAYS)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub shared_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: ItemState,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Lifecycle state of a queue item. The analysis result only exists on
/// `Completed`, so an item can never carry a stale result in another state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ItemState {
    Pending,
    Analyzing,
    Completed {
        result: AnalysisResult,
    },
    Failed {
        #[serde(rename = "errorMessage", default)]
        error_message: String,
    },
    Saved {
        #[serde(rename = "placeId", default, skip_serializing_if = "Option::is_none")]
        place_id: Option<String>,
    },
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
    Saved,
    Ignored,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Analyzing => "analyzing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Saved => "saved",
            QueueStatus::Ignored => "ignored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Saved | QueueStatus::Ignored)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ItemState {
    pub fn status(&self) -> QueueStatus {
        match self {
            ItemState::Pending => QueueStatus::Pending,
            ItemState::Analyzing => QueueStatus::Analyzing,
            ItemState::Completed { .. } => QueueStatus::Completed,
            ItemState::Failed { .. } => QueueStatus::Failed,
            ItemState::Saved { .. } => QueueStatus::Saved,
            ItemState::Ignored => QueueStatus::Ignored,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub place_name: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_info: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<String>,
}

impl QueueItem {
    pub fn new(id: String, url: String, title: Option<String>, shared_at: DateTime<Utc>) -> Self {
        let platform = Platform::detect(&url);
        Self {
            id,
            url,
            title,
            shared_at,
            state: ItemState::Pending,
            retry_count: 0,
            platform,
        }
    }

    pub fn status(&self) -> QueueStatus {
        self.state.status()
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        match &self.state {
            ItemState::Completed { result } => Some(result),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.state {
            ItemState::Failed { error_message } => Some(error_message.as_str()),
            _ => None,
        }
    }

    /// Eligible for an analysis attempt: pending, or failed with retries left.
    pub fn is_processable(&self) -> bool {
        match self.state {
            ItemState::Pending => true,
            ItemState::Failed { .. } => self.retry_count < MAX_RETRY_COUNT,
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.state, ItemState::Failed { .. }) && self.retry_count < MAX_RETRY_COUNT
    }

    pub fn is_high_confidence(&self) -> bool {
        self.result()
            .map(|result| result.confidence >= HIGH_CONFIDENCE_THRESHOLD)
            .unwrap_or(false)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.shared_at) > item_ttl()
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.state = ItemState::Failed {
            error_message: message.into(),
        };
        self.retry_count = self.retry_count.saturating_add(1).min(MAX_RETRY_COUNT);
    }
}
