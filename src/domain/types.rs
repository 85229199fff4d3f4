use serde::Serialize;

/// Derived, read-only view of the queue for badges and status replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub total: usize,
    pub pending: usize,
    pub analyzing: usize,
    pub completed: usize,
    pub failed: usize,
    pub saved: usize,
    pub ignored: usize,
    pub processable: usize,
    pub high_confidence: usize,
    pub progress: f64,
    pub is_processing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub requeued: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRun {
    AlreadyRunning,
    Finished(BatchSummary),
}

impl BatchRun {
    pub fn summary(&self) -> Option<&BatchSummary> {
        match self {
            BatchRun::Finished(summary) => Some(summary),
            BatchRun::AlreadyRunning => None,
        }
    }
}
