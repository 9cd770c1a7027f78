//! Answer generation clients.
//!
//! Defines the [`Generator`] seam used by the query orchestrator and the
//! HTTP-backed [`GenerationClient`] that streams completions from the
//! active provider:
//! - **Ollama** — `POST /api/generate` with `stream: true` (NDJSON lines).
//! - **OpenAI** — `POST /v1/chat/completions` with `stream: true` (SSE
//!   `data:` lines, `[DONE]` terminator).
//!
//! Fragments are produced over a bounded channel. When the consumer drops
//! the receiver, the next send fails and the producer stops reading the
//! upstream response, which aborts the HTTP transfer — no further provider
//! work happens after a disconnect. Silence between fragments longer than
//! the configured idle timeout fails the stream with a provider error
//! instead of hanging.

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::providers::{OLLAMA_KEY, OPENAI_KEY};

/// Streaming text-generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Start generating for `prompt`. Each received item is one incremental
    /// text fragment; an `Err` item terminates the stream.
    async fn stream(&self, prompt: &str) -> AppResult<mpsc::Receiver<AppResult<String>>>;
}

/// Compose the grounded prompt from the question and tagged context blocks.
pub fn build_prompt(question: &str, contexts: &[String]) -> String {
    let context_text = contexts.join("\n\n");
    format!(
        "System role: You are a focused RAG assistant. Use ONLY the provided context to answer. \
         If the context is missing or unclear, say `I don't know based on the provided documents.`\n\
         Guidelines:\n\
         - Be concise and factual.\n\
         - Do not invent details.\n\
         - Write a coherent, flowing response.\n\
         - If multiple sources support a point, list them together in brackets at the end.\n\
         - If context conflicts, state the conflict briefly, then cite sources at the end.\n\n\
         Context:\n{context_text}\n\n\
         Question: {question}\n\
         Answer:"
    )
}

/// HTTP generation client for the currently selected provider/model pair.
pub struct GenerationClient {
    provider: String,
    model: String,
    ollama_base_url: String,
    openai_base_url: String,
    api_key: Option<String>,
    idle_timeout: Duration,
    http: reqwest::Client,
}

impl GenerationClient {
    pub fn new(settings: &Settings, provider: &str, model: &str) -> AppResult<Self> {
        // No whole-request timeout: generations legitimately run for
        // minutes. Liveness is enforced per-fragment by the idle timeout.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.providers.request_timeout_secs))
            .build()
            .map_err(|e| AppError::GenerationFailed(e.to_string()))?;

        Ok(Self {
            provider: provider.to_string(),
            model: model.to_string(),
            ollama_base_url: settings.providers.ollama_base_url.clone(),
            openai_base_url: settings.providers.openai_base_url.clone(),
            api_key: settings.openai_api_key(),
            idle_timeout: Duration::from_secs(settings.providers.stream_idle_timeout_secs),
            http,
        })
    }

    async fn start_request(&self, prompt: &str) -> AppResult<reqwest::Response> {
        let request = match self.provider.as_str() {
            OLLAMA_KEY => self
                .http
                .post(format!("{}/api/generate", self.ollama_base_url))
                .json(&serde_json::json!({
                    "model": self.model,
                    "prompt": prompt,
                    "stream": true,
                })),
            OPENAI_KEY => {
                let api_key = self.api_key.as_ref().ok_or_else(|| {
                    AppError::GenerationFailed("OpenAI API key not set".to_string())
                })?;
                self.http
                    .post(format!("{}/v1/chat/completions", self.openai_base_url))
                    .bearer_auth(api_key)
                    .json(&serde_json::json!({
                        "model": self.model,
                        "messages": [{ "role": "user", "content": prompt }],
                        "stream": true,
                    }))
            }
            other => {
                return Err(AppError::GenerationFailed(format!(
                    "unknown generation provider: {}",
                    other
                )))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| AppError::GenerationFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GenerationFailed(format!(
                "provider returned {}: {}",
                status, body
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl Generator for GenerationClient {
    async fn stream(&self, prompt: &str) -> AppResult<mpsc::Receiver<AppResult<String>>> {
        let response = self.start_request(prompt).await?;
        let (tx, rx) = mpsc::channel(32);
        let provider = self.provider.clone();
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let next = tokio::time::timeout(idle_timeout, body.next()).await;

                let chunk = match next {
                    Err(_) => {
                        let _ = tx
                            .send(Err(AppError::GenerationFailed(
                                "generation stream timed out".to_string(),
                            )))
                            .await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(AppError::GenerationFailed(e.to_string()))).await;
                        return;
                    }
                    Ok(Some(Ok(bytes))) => bytes,
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Process complete lines from the buffer
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);

                    let Some(fragment) = parse_stream_line(&provider, &line) else {
                        continue;
                    };
                    if fragment.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(fragment)).await.is_err() {
                        // Consumer disconnected: stop reading upstream.
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Extract the text fragment from one provider stream line, if any.
fn parse_stream_line(provider: &str, line: &str) -> Option<String> {
    if line.is_empty() {
        return None;
    }

    match provider {
        OLLAMA_KEY => {
            let json: serde_json::Value = serde_json::from_str(line).ok()?;
            json.get("response")
                .and_then(|r| r.as_str())
                .map(str::to_string)
        }
        OPENAI_KEY => {
            let data = line.strip_prefix("data: ")?;
            if data == "[DONE]" {
                return None;
            }
            let json: serde_json::Value = serde_json::from_str(data).ok()?;
            json.get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
                .map(str::to_string)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_contexts_and_question() {
        let contexts = vec![
            "[doc_id=1]\nAlpha context.".to_string(),
            "[doc_id=2, page=3]\nBeta context.".to_string(),
        ];
        let prompt = build_prompt("What is alpha?", &contexts);
        assert!(prompt.contains("Alpha context."));
        assert!(prompt.contains("[doc_id=2, page=3]"));
        assert!(prompt.contains("Question: What is alpha?"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn parses_ollama_stream_line() {
        let line = r#"{"model":"gemma3:4b","response":"Hello","done":false}"#;
        assert_eq!(parse_stream_line(OLLAMA_KEY, line).as_deref(), Some("Hello"));
    }

    #[test]
    fn parses_openai_stream_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(parse_stream_line(OPENAI_KEY, line).as_deref(), Some("Hi"));
    }

    #[test]
    fn openai_done_marker_yields_nothing() {
        assert_eq!(parse_stream_line(OPENAI_KEY, "data: [DONE]"), None);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        assert_eq!(parse_stream_line(OLLAMA_KEY, "not json"), None);
        assert_eq!(parse_stream_line(OPENAI_KEY, ": keepalive"), None);
    }
}
