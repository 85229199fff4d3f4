use serde::{Deserialize, Serialize};

use crate::domain::AnalysisResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisStatus {
    Pending,
    #[serde(alias = "in_progress", alias = "processing")]
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub status: AnalysisStatus,
    #[serde(default)]
    pub analysis_id: Option<String>,
    #[serde(default)]
    pub place_info: Option<PlaceInfo>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceInfo {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub extracted_info: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AnalyzeRequest<'a> {
    pub url: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SavePlaceRequest<'a> {
    pub source_url: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SavePlaceResponse {
    pub place_id: String,
}

impl AnalysisResponse {
    /// Maps a completed response to the stored result. `None` when the
    /// server reported completion without a place payload.
    pub fn into_result(self) -> Option<AnalysisResult> {
        let place = self.place_info?;
        let confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some(AnalysisResult {
            place_name: place.name,
            category: place.category,
            address: place.address,
            image_url: place.image_url,
            confidence,
            tags: place.tags,
            extracted_info: place.extracted_info,
            analysis_id: self.analysis_id,
        })
    }
}
