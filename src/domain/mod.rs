pub mod item;
pub mod platform;
pub mod types;

pub use item::{AnalysisResult, ItemState, QueueItem, QueueStatus};
pub use types::{BatchRun, BatchSummary, QueueSnapshot};
