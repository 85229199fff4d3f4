use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};

use crate::config::GatewayConfig;

use super::{
    gateway::AnalysisGateway,
    types::{AnalysisResponse, AnalyzeRequest, SavePlaceRequest, SavePlaceResponse},
};

#[derive(Clone)]
pub struct HttpAnalysisGateway {
    http: Client,
    config: GatewayConfig,
}

impl HttpAnalysisGateway {
    pub fn new(http: Client, config: GatewayConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.timeout(self.config.request_timeout);
        match self.config.api_token.as_ref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl AnalysisGateway for HttpAnalysisGateway {
    async fn analyze_link(&self, url: &str) -> Result<AnalysisResponse> {
        let response = self
            .authorize(self.http.post(self.endpoint("analyze")))
            .json(&AnalyzeRequest { url })
            .send()
            .await
            .with_context(|| format!("failed to request analysis for {url}"))?
            .error_for_status()?;

        let analysis = response
            .json::<AnalysisResponse>()
            .await
            .context("analysis response was not valid JSON")?;
        tracing::debug!(
            target: "gateway",
            url,
            status = ?analysis.status,
            analysis_id = analysis.analysis_id.as_deref(),
            "analysis requested"
        );
        Ok(analysis)
    }

    async fn get_status(&self, analysis_id: &str) -> Result<AnalysisResponse> {
        let response = self
            .authorize(self.http.get(self.endpoint(&format!("analyze/{analysis_id}"))))
            .send()
            .await
            .with_context(|| format!("failed to fetch analysis status {analysis_id}"))?
            .error_for_status()?;

        let analysis = response
            .json::<AnalysisResponse>()
            .await
            .context("analysis status response was not valid JSON")?;
        Ok(analysis)
    }

    async fn save_place(&self, analysis_id: &str, source_url: &str) -> Result<String> {
        let response = self
            .authorize(
                self.http
                    .post(self.endpoint(&format!("analyze/{analysis_id}/save"))),
            )
            .json(&SavePlaceRequest { source_url })
            .send()
            .await
            .with_context(|| format!("failed to save place for analysis {analysis_id}"))?
            .error_for_status()?;

        let saved = response
            .json::<SavePlaceResponse>()
            .await
            .context("save place response was not valid JSON")?;
        tracing::info!(target: "gateway", analysis_id, place_id = %saved.place_id, "place saved");
        Ok(saved.place_id)
    }

    async fn cancel_analysis(&self, analysis_id: &str) -> Result<()> {
        self.authorize(
            self.http
                .delete(self.endpoint(&format!("analyze/{analysis_id}"))),
        )
        .send()
        .await
        .with_context(|| format!("failed to cancel analysis {analysis_id}"))?
        .error_for_status()?;
        Ok(())
    }
}
