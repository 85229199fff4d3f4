use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    types::{AnalysisResponse, PlaceInfo},
    AnalysisGateway, AnalysisStatus,
};

/// Gateway fake that replays queued responses and records every call.
#[derive(Default)]
pub struct ScriptedGateway {
    analyze: Mutex<VecDeque<Result<AnalysisResponse>>>,
    status: Mutex<VecDeque<Result<AnalysisResponse>>>,
    save: Mutex<VecDeque<Result<String>>>,
    calls: Mutex<Calls>,
}

#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub analyzed: Vec<String>,
    pub polled: Vec<String>,
    pub saved: Vec<(String, String)>,
    pub cancelled: Vec<String>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_analyze(&self, response: Result<AnalysisResponse>) -> &Self {
        self.analyze.lock().push_back(response);
        self
    }

    pub fn push_status(&self, response: Result<AnalysisResponse>) -> &Self {
        self.status.lock().push_back(response);
        self
    }

    pub fn push_save(&self, response: Result<String>) -> &Self {
        self.save.lock().push_back(response);
        self
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AnalysisGateway for ScriptedGateway {
    async fn analyze_link(&self, url: &str) -> Result<AnalysisResponse> {
        self.calls.lock().analyzed.push(url.to_string());
        self.analyze
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted analyze response")))
    }

    async fn get_status(&self, analysis_id: &str) -> Result<AnalysisResponse> {
        self.calls.lock().polled.push(analysis_id.to_string());
        self.status
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(in_progress(analysis_id)))
    }

    async fn save_place(&self, analysis_id: &str, source_url: &str) -> Result<String> {
        self.calls
            .lock()
            .saved
            .push((analysis_id.to_string(), source_url.to_string()));
        self.save
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted save response")))
    }

    async fn cancel_analysis(&self, analysis_id: &str) -> Result<()> {
        self.calls.lock().cancelled.push(analysis_id.to_string());
        Ok(())
    }
}

pub fn completed(analysis_id: &str, confidence: f64) -> AnalysisResponse {
    AnalysisResponse {
        status: AnalysisStatus::Completed,
        analysis_id: Some(analysis_id.to_string()),
        place_info: Some(PlaceInfo {
            name: format!("place for {analysis_id}"),
            category: "restaurant".into(),
            address: None,
            image_url: None,
            tags: vec!["food".into()],
            extracted_info: None,
        }),
        confidence,
        error: None,
    }
}

pub fn in_progress(analysis_id: &str) -> AnalysisResponse {
    AnalysisResponse {
        status: AnalysisStatus::InProgress,
        analysis_id: Some(analysis_id.to_string()),
        place_info: None,
        confidence: 0.0,
        error: None,
    }
}

pub fn failed(message: &str) -> AnalysisResponse {
    AnalysisResponse {
        status: AnalysisStatus::Failed,
        analysis_id: None,
        place_info: None,
        confidence: 0.0,
        error: Some(message.to_string()),
    }
}
