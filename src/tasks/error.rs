use thiserror::Error;

use crate::domain::QueueStatus;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid URL: {0}")]
    Validation(String),
    #[error("queue is full ({capacity} items)")]
    Capacity { capacity: usize },
    #[error("URL is already queued: {0}")]
    Duplicate(String),
    #[error("analysis service error: {0}")]
    Gateway(String),
    #[error("analysis did not finish after {attempts} status checks")]
    Timeout { attempts: u32 },
    #[error("queue persistence failed: {0}")]
    Persistence(String),
    #[error("queue item not found: {0}")]
    NotFound(String),
    #[error("item {id} is {status}; cannot {action}")]
    InvalidState {
        id: String,
        status: QueueStatus,
        action: &'static str,
    },
}

impl QueueError {
    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        QueueError::Persistence(err.to_string())
    }
}
