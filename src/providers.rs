//! Provider registry.
//!
//! Describes the generation/embedding providers this deployment can talk to
//! and the models each currently offers. The set is closed: every provider
//! is a concrete type implementing [`Provider`] with an availability probe
//! and a live model listing.
//!
//! Listings are fetched on every call (availability changes between calls —
//! models get pulled, keys get revoked). Network and API failures degrade to
//! an empty list with a warning; only an unknown provider key is an error.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::models::{ModelDescriptor, ProviderDescriptor, ProviderKind};

pub const OLLAMA_KEY: &str = "ollama";
pub const OPENAI_KEY: &str = "openai";

/// A generation/embedding backend with a reachability probe and a live
/// model listing.
#[async_trait]
pub trait Provider: Send + Sync {
    fn key(&self) -> &'static str;
    fn label(&self) -> &'static str;
    async fn is_available(&self) -> bool;
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>>;
}

// ============ Ollama ============

pub struct OllamaProvider {
    base_url: String,
    timeout_secs: u64,
}

impl OllamaProvider {
    pub fn new(settings: &Settings) -> Self {
        Self {
            base_url: settings.providers.ollama_base_url.clone(),
            timeout_secs: settings.providers.request_timeout_secs,
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn key(&self) -> &'static str {
        OLLAMA_KEY
    }

    fn label(&self) -> &'static str {
        "Ollama"
    }

    async fn is_available(&self) -> bool {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs.min(5)))
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };

        client
            .get(format!("{}/api/version", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let json: serde_json::Value = client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut models = Vec::new();
        for entry in json
            .get("models")
            .and_then(|m| m.as_array())
            .unwrap_or(&Vec::new())
        {
            let id = entry
                .get("model")
                .or_else(|| entry.get("name"))
                .and_then(|v| v.as_str());
            let Some(id) = id else { continue };
            let label = entry
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(id);
            let context_length = entry
                .get("details")
                .and_then(|d| d.get("context_length"))
                .and_then(|v| v.as_u64());

            models.push(ModelDescriptor {
                id: id.to_string(),
                label: label.to_string(),
                context_length,
            });
        }

        Ok(models)
    }
}

// ============ OpenAI ============

/// Context windows for well-known OpenAI models; the listing API does not
/// report them.
const OPENAI_CONTEXT_LENGTHS: &[(&str, u64)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4-32k", 32_768),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("text-embedding-3-small", 8_191),
    ("text-embedding-3-large", 8_191),
    ("text-embedding-ada-002", 8_191),
];

pub struct OpenAIProvider {
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl OpenAIProvider {
    pub fn new(settings: &Settings) -> Self {
        Self {
            base_url: settings.providers.openai_base_url.clone(),
            api_key: settings.openai_api_key(),
            timeout_secs: settings.providers.request_timeout_secs,
        }
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn key(&self) -> &'static str {
        OPENAI_KEY
    }

    fn label(&self) -> &'static str {
        "OpenAI"
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("OpenAI API key not configured"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let json: serde_json::Value = client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut models = Vec::new();
        for entry in json
            .get("data")
            .and_then(|d| d.as_array())
            .unwrap_or(&Vec::new())
        {
            let Some(id) = entry.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let context_length = OPENAI_CONTEXT_LENGTHS
                .iter()
                .find(|(prefix, _)| id.starts_with(prefix))
                .map(|(_, len)| *len);

            models.push(ModelDescriptor {
                id: id.to_string(),
                label: id.to_string(),
                context_length,
            });
        }

        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

// ============ Registry ============

fn registry(settings: &Settings) -> Vec<Box<dyn Provider>> {
    vec![
        Box::new(OllamaProvider::new(settings)),
        Box::new(OpenAIProvider::new(settings)),
    ]
}

/// Descriptors for every provider whose backing service is reachable.
pub async fn available_providers(
    settings: &Settings,
    kind: ProviderKind,
) -> Vec<ProviderDescriptor> {
    let mut out = Vec::new();
    for provider in registry(settings) {
        if provider.is_available().await {
            out.push(ProviderDescriptor {
                key: provider.key().to_string(),
                label: provider.label().to_string(),
                kind,
            });
        }
    }
    out
}

/// Live model listing for one provider. Unknown keys are an error; a known
/// but unreachable provider lists as empty, as does a listing failure.
pub async fn list_models_for_provider(
    settings: &Settings,
    provider_key: &str,
) -> AppResult<Vec<ModelDescriptor>> {
    let provider = registry(settings)
        .into_iter()
        .find(|p| p.key() == provider_key)
        .ok_or_else(|| AppError::ProviderNotFound(provider_key.to_string()))?;

    if !provider.is_available().await {
        return Ok(Vec::new());
    }

    match provider.list_models().await {
        Ok(models) => Ok(models),
        Err(e) => {
            warn!("failed to list models for provider {}: {}", provider_key, e);
            Ok(Vec::new())
        }
    }
}

/// Everything `set_models` needs to validate a selection, captured in one
/// probe pass so validation itself is a pure function.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    pub available_keys: Vec<String>,
    pub chat_models: Vec<String>,
    pub embedding_models: Vec<String>,
}

/// Probe availability and fetch the model listings for the two providers
/// named by a pending selection.
pub async fn catalog_for_selection(
    settings: &Settings,
    chat_provider: &str,
    embedding_provider: &str,
) -> ProviderCatalog {
    let mut available_keys = Vec::new();
    for provider in registry(settings) {
        if provider.is_available().await {
            available_keys.push(provider.key().to_string());
        }
    }

    let chat_models = match list_models_for_provider(settings, chat_provider).await {
        Ok(models) => models.into_iter().map(|m| m.id).collect(),
        Err(_) => Vec::new(),
    };
    let embedding_models = if embedding_provider == chat_provider {
        chat_models.clone()
    } else {
        match list_models_for_provider(settings, embedding_provider).await {
            Ok(models) => models.into_iter().map(|m| m.id).collect(),
            Err(_) => Vec::new(),
        }
    };

    ProviderCatalog {
        available_keys,
        chat_models,
        embedding_models,
    }
}
