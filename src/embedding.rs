//! Embedding clients.
//!
//! Defines the [`Embedder`] seam consumed by the ingestion pipeline and the
//! retrieval engine, and the HTTP-backed [`EmbeddingClient`] that speaks to
//! the active provider:
//! - **Ollama** — `POST /api/embeddings`, one prompt per call.
//! - **OpenAI** — `POST /v1/embeddings` with batching, retry, and backoff.
//!
//! # Retry Strategy (OpenAI)
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::providers::{OLLAMA_KEY, OPENAI_KEY};

/// Text-to-vector capability. The pipeline depends on this trait rather
/// than a concrete client so tests can substitute a deterministic embedder.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// The model identifier the vectors are attributed to.
    fn model_name(&self) -> &str;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_texts(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        let vectors = self.embed_texts(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::EmbeddingFailed("empty embedding response".to_string()))
    }
}

/// HTTP embedding client for the currently selected provider/model pair.
pub struct EmbeddingClient {
    provider: String,
    model: String,
    ollama_base_url: String,
    openai_base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    http: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(settings: &Settings, provider: &str, model: &str) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.providers.request_timeout_secs))
            .build()
            .map_err(|e| AppError::EmbeddingFailed(e.to_string()))?;

        Ok(Self {
            provider: provider.to_string(),
            model: model.to_string(),
            ollama_base_url: settings.providers.ollama_base_url.clone(),
            openai_base_url: settings.providers.openai_base_url.clone(),
            api_key: settings.openai_api_key(),
            max_retries: settings.providers.max_retries,
            http,
        })
    }

    async fn embed_ollama(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());

        for text in texts {
            let body = serde_json::json!({
                "model": self.model,
                "prompt": text,
            });

            let json: serde_json::Value = self
                .http
                .post(format!("{}/api/embeddings", self.ollama_base_url))
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::EmbeddingFailed(e.to_string()))?
                .error_for_status()
                .map_err(|e| AppError::EmbeddingFailed(e.to_string()))?
                .json()
                .await
                .map_err(|e| AppError::EmbeddingFailed(e.to_string()))?;

            let vector: Vec<f32> = json
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    AppError::EmbeddingFailed("missing embedding in response".to_string())
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();

            vectors.push(vector);
        }

        Ok(vectors)
    }

    async fn embed_openai(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AppError::EmbeddingFailed("OpenAI API key not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(format!("{}/v1/embeddings", self.openai_base_url))
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| AppError::EmbeddingFailed(e.to_string()))?;
                        return parse_openai_response(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(AppError::EmbeddingFailed(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(AppError::EmbeddingFailed(
            last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
        ))
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_texts(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match self.provider.as_str() {
            OLLAMA_KEY => self.embed_ollama(texts).await,
            OPENAI_KEY => self.embed_openai(texts).await,
            other => Err(AppError::EmbeddingFailed(format!(
                "unknown embedding provider: {}",
                other
            ))),
        }
    }
}

fn parse_openai_response(json: &serde_json::Value) -> AppResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| AppError::EmbeddingFailed("missing data array in response".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                AppError::EmbeddingFailed("missing embedding in response item".to_string())
            })?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_embedding_payload() {
        let json = serde_json::json!({
            "data": [
                { "embedding": [0.1, 0.2] },
                { "embedding": [0.3, 0.4] },
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn rejects_malformed_payload() {
        let json = serde_json::json!({ "data": [{ "vector": [1.0] }] });
        assert!(parse_openai_response(&json).is_err());
    }
}
