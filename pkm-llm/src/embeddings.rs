use crate::client::build_http_client;
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const VOYAGE_EMBEDDINGS_URL: &str = "https://api.voyageai.com/v1/embeddings";

/// Turns query text into a fixed-dimension vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Clone)]
pub struct VoyageEmbeddings {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl VoyageEmbeddings {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            http: build_http_client(timeout),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct VoyageRequest<'a> {
    input: [&'a str; 1],
    model: &'a str,
    input_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct VoyageResponse {
    #[serde(default)]
    data: Vec<VoyageEmbedding>,
    #[serde(default)]
    usage: Option<VoyageUsage>,
}

#[derive(Debug, Deserialize)]
struct VoyageEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct VoyageUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl EmbeddingProvider for VoyageEmbeddings {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(LlmError::InvalidInput(
                "cannot embed empty query".to_string(),
            ));
        }
        let req = VoyageRequest {
            input: [text],
            model: &self.model,
            input_type: "query",
        };
        let response = self
            .http
            .post(VOYAGE_EMBEDDINGS_URL)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited(format!(
                "voyage status={status} body={body}"
            )));
        }
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "voyage embeddings status={status} body={body}"
            )));
        }
        parse_voyage_response(&body)
    }
}

fn parse_voyage_response(body: &str) -> Result<Vec<f32>> {
    let parsed: VoyageResponse = serde_json::from_str(body)?;
    if let Some(usage) = parsed.usage.as_ref() {
        tracing::debug!(total_tokens = usage.total_tokens, "query embedded");
    }
    let embedding = parsed
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .ok_or_else(|| LlmError::ResponseFormat("voyage response has no embeddings".to_string()))?;
    if embedding.is_empty() {
        return Err(LlmError::ResponseFormat(
            "voyage returned an empty embedding".to_string(),
        ));
    }
    Ok(embedding)
}
