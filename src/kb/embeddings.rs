/// HTTP embeddings client (OpenAI-compatible wire format).
///
/// The provider is optional: when the endpoint is unset or the call fails,
/// ingestion persists chunks without embeddings and search degrades to no
/// semantic matches. A later backfill pass re-embeds those chunks.
use crate::config::EmbeddingsConfig;
use crate::errors::{OxiclawError, OxiclawResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

pub const PROVIDER_NAME: &str = "openai-compatible";

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

pub struct EmbeddingsClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl EmbeddingsClient {
    pub fn new(config: &EmbeddingsConfig) -> OxiclawResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OxiclawError::EmbeddingsUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed a batch of texts. One vector per input, in order.
    pub async fn embed_batch(&self, texts: &[String]) -> OxiclawResult<Vec<Vec<f32>>> {
        if !self.is_configured() {
            return Err(OxiclawError::EmbeddingsUnavailable(
                "no endpoint configured".to_string(),
            ));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingsRequest {
            model: &self.model,
            input: texts,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| OxiclawError::EmbeddingsUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OxiclawError::EmbeddingsUnavailable(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| OxiclawError::EmbeddingsUnavailable(e.to_string()))?;

        if body.data.len() != texts.len() {
            return Err(OxiclawError::EmbeddingsUnavailable(format!(
                "provider returned {} vectors for {} inputs",
                body.data.len(),
                texts.len()
            )));
        }

        info!("embedded {} texts via {}", texts.len(), self.model);
        Ok(body.data.into_iter().map(|row| row.embedding).collect())
    }

    pub async fn embed_query(&self, query: &str) -> OxiclawResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[query.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| OxiclawError::EmbeddingsUnavailable("empty embedding result".into()))
    }
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Pack an embedding into the little-endian byte form stored in SQLite.
pub fn serialize_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|value| value.to_le_bytes()).collect()
}

/// Unpack a little-endian embedding blob. Rejects blobs whose length is
/// not a whole number of f32 values (a corrupted row, not a panic).
pub fn deserialize_embedding(bytes: &[u8]) -> anyhow::Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        anyhow::bail!("embedding blob length {} is not a multiple of 4", bytes.len());
    }
    let mut values = Vec::with_capacity(bytes.len() / 4);
    for quad in bytes.chunks_exact(4) {
        values.push(f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]));
    }
    Ok(values)
}
