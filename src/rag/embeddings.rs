//! Embeddings client (OpenAI-compatible `/embeddings` endpoint).

use anyhow::{bail, Result};
use reqwest::Client as HttpClient;
use serde::Deserialize;

pub struct EmbeddingsClient {
    client: HttpClient,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl EmbeddingsClient {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Self {
        Self {
            client: HttpClient::new(),
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').into(),
            model: model.into(),
        }
    }

    /// Embed a batch of texts; order of the result matches the input.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("Embeddings API error {status}: {text}");
        }
        let parsed: EmbeddingsResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }
}
