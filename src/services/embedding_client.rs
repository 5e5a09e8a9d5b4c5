//! Embedding service client.
//!
//! Turns free text into the fixed-length vector used for nearest-neighbor
//! lookup against embedded document fragments.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::retrieval::sources::{EmbeddingSource, SourceError, SourceResult};

#[derive(Clone)]
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    token: String,
    expected_dims: usize,
}

impl EmbeddingClient {
    pub fn new(
        base_url: &str,
        token: &str,
        timeout_seconds: u64,
        expected_dims: usize,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        tracing::info!(base_url = base_url, dims = expected_dims, "embedding client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            expected_dims,
        })
    }
}

#[async_trait]
impl EmbeddingSource for EmbeddingClient {
    async fn embed(&self, text: &str) -> SourceResult<Vec<f32>> {
        #[derive(Serialize)]
        struct Request<'a> {
            input: &'a str,
        }

        #[derive(Deserialize)]
        struct Response {
            embedding: Vec<f32>,
        }

        let url = format!("{}/v1/embeddings", self.base_url);
        debug!(url = %url, "embedding request");

        let response = self
            .client
            .post(&url)
            .header("X-Internal-Token", &self.token)
            .json(&Request { input: text })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout
                } else {
                    error!(error = %e, "embedding request failed");
                    SourceError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "embedding service error: {}",
                status
            )));
        }

        let body: Response = response
            .json()
            .await
            .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;

        if body.embedding.len() != self.expected_dims {
            return Err(SourceError::InvalidResponse(format!(
                "expected {}-dim embedding, got {}",
                self.expected_dims,
                body.embedding.len()
            )));
        }

        Ok(body.embedding)
    }
}
