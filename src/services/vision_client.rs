//! Vision extraction service client.
//!
//! Talks to the vision-capable LLM service that turns rasterized drawing
//! pages into structured JSON. The service is treated as an opaque,
//! possibly-imperfect oracle: responses are deserialized and range-checked
//! downstream, never assumed accurate. All failures map to [`SourceError`]
//! so the router and ingestion pipeline can degrade per step.

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument};

use crate::retrieval::sources::{
    ExtractionProfile, SheetExtraction, SheetPage, SourceError, SourceResult, VisionSource,
    VisualFindings, VisualTask,
};

/// Client for the vision extraction service.
#[derive(Clone)]
pub struct VisionClient {
    client: Client,
    base_url: String,
    token: String,
}

/// Error body the vision service returns on non-2xx responses.
#[derive(Debug, Deserialize)]
struct VisionErrorResponse {
    message: String,
}

impl VisionClient {
    pub fn new(base_url: &str, token: &str, timeout_seconds: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        tracing::info!(base_url = base_url, "vision client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn post<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> SourceResult<R> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "vision service request");

        let response = self
            .client
            .post(&url)
            .header("X-Internal-Token", &self.token)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout
                } else {
                    error!(error = %e, "vision service request failed");
                    SourceError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<R>()
                .await
                .map_err(|e| SourceError::InvalidResponse(e.to_string()))
        } else {
            let message = response
                .json::<VisionErrorResponse>()
                .await
                .map(|e| e.message)
                .unwrap_or_else(|_| format!("vision service error: {}", status));
            error!(status = %status, message = %message, "vision service error");
            Err(SourceError::Unavailable(message))
        }
    }

    /// Check vision service health.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/health", self.base_url);
        self.client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl VisionSource for VisionClient {
    /// Extract structured records from one page under a task profile.
    #[instrument(skip(self, page), fields(sheet_number = ?page.sheet_number))]
    async fn extract_sheet(
        &self,
        page: &SheetPage,
        profile: ExtractionProfile,
    ) -> SourceResult<SheetExtraction> {
        #[derive(Serialize)]
        struct Request<'a> {
            page: &'a SheetPage,
            profile: ExtractionProfile,
        }

        #[derive(Deserialize)]
        struct Response {
            extraction: SheetExtraction,
        }

        let response: Response = self
            .post("/v1/sheets/extract", &Request { page, profile })
            .await?;

        Ok(response.extraction)
    }

    /// On-demand inspection of a bounded sheet set for a specific question.
    #[instrument(skip(self, task), fields(sheet_count = task.sheets.len()))]
    async fn inspect(&self, task: &VisualTask) -> SourceResult<VisualFindings> {
        #[derive(Deserialize)]
        struct Response {
            findings: VisualFindings,
        }

        let response: Response = self.post("/v1/sheets/inspect", task).await?;
        Ok(response.findings)
    }
}
