use anyhow::Result;
use async_trait::async_trait;

use super::types::AnalysisResponse;

/// Remote link-analysis service. Calls are never retried here; retry policy
/// belongs to the queue controller.
#[async_trait]
pub trait AnalysisGateway: Send + Sync {
    async fn analyze_link(&self, url: &str) -> Result<AnalysisResponse>;

    async fn get_status(&self, analysis_id: &str) -> Result<AnalysisResponse>;

    /// Persists the analysed place and returns its place id.
    async fn save_place(&self, analysis_id: &str, source_url: &str) -> Result<String>;

    /// Best-effort; the server may keep working on the job.
    async fn cancel_analysis(&self, analysis_id: &str) -> Result<()>;
}
