//! Runtime configuration store.
//!
//! Process-wide model and retrieval settings, persisted as a single JSON
//! file under the storage root:
//!
//! ```json
//! {
//!   "chat_provider": "ollama",
//!   "chat_model": "gemma3:4b",
//!   "embedding_provider": "ollama",
//!   "embedding_model": "embeddinggemma:latest",
//!   "rag": {
//!     "retrieval_strategy": "similarity",
//!     "top_k": 12,
//!     "score_threshold": null,
//!     "fetch_k": 20,
//!     "lambda_mult": 0.5,
//!     "chunking_method": null,
//!     "vector_backend": "sqlite"
//!   }
//! }
//! ```
//!
//! Every read and write goes through one async mutex, so no caller observes
//! a half-written file. A missing, corrupt, or `rag`-less file is healed to
//! defaults on first read. Mutations are validated transactions: nothing is
//! written when validation fails.
//!
//! The store owns the provider client cache. A successful `set_models`
//! invalidates every cached client; `set_retrieval` invalidates only the
//! vector-index handle. Call sites never clear caches themselves.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Settings;
use crate::embedding::EmbeddingClient;
use crate::error::{AppError, AppResult};
use crate::generation::GenerationClient;
use crate::providers::{self, ProviderCatalog};
use crate::retrieval::RetrievalStrategy;
use crate::vector::{SqliteVectorIndex, VectorIndex};

pub const DEFAULT_VECTOR_BACKEND: &str = "sqlite";

/// Active provider/model selection for generation and embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeModels {
    pub chat_provider: String,
    pub chat_model: String,
    pub embedding_provider: String,
    pub embedding_model: String,
}

/// Active retrieval configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRetrieval {
    pub retrieval_strategy: String,
    pub top_k: usize,
    #[serde(default)]
    pub score_threshold: Option<f64>,
    #[serde(default)]
    pub fetch_k: Option<usize>,
    #[serde(default)]
    pub lambda_mult: Option<f64>,
    #[serde(default)]
    pub chunking_method: Option<String>,
    #[serde(default)]
    pub vector_backend: String,
}

/// On-disk layout: model fields at the top level, retrieval under `rag`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuntimeFile {
    #[serde(flatten)]
    models: RuntimeModels,
    rag: Option<RuntimeRetrieval>,
}

/// Lazily built provider clients, shared across requests and invalidated
/// on configuration change. Invalidation is not atomic with respect to
/// in-flight requests: a request already holding an `Arc` finishes on the
/// pre-change client.
#[derive(Default)]
struct ClientCache {
    embedding: SyncMutex<Option<Arc<EmbeddingClient>>>,
    generation: SyncMutex<Option<Arc<GenerationClient>>>,
    vector: SyncMutex<Option<Arc<dyn VectorIndex>>>,
}

impl ClientCache {
    fn invalidate_all(&self) {
        *self.embedding.lock().unwrap() = None;
        *self.generation.lock().unwrap() = None;
        *self.vector.lock().unwrap() = None;
    }

    fn invalidate_vector(&self) {
        *self.vector.lock().unwrap() = None;
    }
}

/// Thread-safe runtime configuration store. Reads return immutable
/// snapshots; writes are validated transactions.
pub struct RuntimeStore {
    settings: Arc<Settings>,
    path: PathBuf,
    lock: Mutex<()>,
    cache: ClientCache,
}

impl RuntimeStore {
    pub fn new(settings: Arc<Settings>) -> Self {
        let path = settings.runtime_config_path();
        Self {
            settings,
            path,
            lock: Mutex::new(()),
            cache: ClientCache::default(),
        }
    }

    fn default_models(&self) -> RuntimeModels {
        RuntimeModels {
            chat_provider: providers::OLLAMA_KEY.to_string(),
            chat_model: self.settings.providers.chat_model.clone(),
            embedding_provider: providers::OLLAMA_KEY.to_string(),
            embedding_model: self.settings.providers.embedding_model.clone(),
        }
    }

    fn default_retrieval(&self) -> RuntimeRetrieval {
        RuntimeRetrieval {
            retrieval_strategy: RetrievalStrategy::Similarity.as_str().to_string(),
            top_k: self.settings.retrieval.top_k,
            score_threshold: None,
            fetch_k: Some(20),
            lambda_mult: Some(0.5),
            chunking_method: None,
            vector_backend: DEFAULT_VECTOR_BACKEND.to_string(),
        }
    }

    /// Read the file, healing a missing/corrupt file or a missing `rag`
    /// block back to defaults. Must be called with the lock held.
    fn load_or_init(&self) -> RuntimeFile {
        let parsed = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<RuntimeFile>(&raw).ok());

        match parsed {
            Some(mut file) => {
                if file.rag.is_none() {
                    file.rag = Some(self.default_retrieval());
                    self.write_file(&file);
                }
                file
            }
            None => {
                let file = RuntimeFile {
                    models: self.default_models(),
                    rag: Some(self.default_retrieval()),
                };
                self.write_file(&file);
                file
            }
        }
    }

    fn write_file(&self, file: &RuntimeFile) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("failed to create storage dir: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(file) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!("failed to persist runtime config: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize runtime config: {}", e),
        }
    }

    /// Snapshot of the active model selection.
    pub async fn models(&self) -> RuntimeModels {
        let _guard = self.lock.lock().await;
        self.load_or_init().models
    }

    /// Snapshot of the active retrieval configuration.
    pub async fn retrieval(&self) -> RuntimeRetrieval {
        let _guard = self.lock.lock().await;
        self.load_or_init()
            .rag
            .unwrap_or_else(|| self.default_retrieval())
    }

    /// Validate and persist a new model selection. Providers are checked
    /// before models; the first violation wins and nothing is written. On
    /// success every cached client is invalidated.
    pub async fn set_models(&self, selection: RuntimeModels) -> AppResult<RuntimeModels> {
        let catalog = providers::catalog_for_selection(
            &self.settings,
            &selection.chat_provider,
            &selection.embedding_provider,
        )
        .await;

        self.apply_models(selection, &catalog).await
    }

    /// Validation + write against an already-probed catalog. Split from
    /// [`set_models`] so the transition logic is testable without network.
    async fn apply_models(
        &self,
        selection: RuntimeModels,
        catalog: &ProviderCatalog,
    ) -> AppResult<RuntimeModels> {
        validate_models(&selection, catalog)?;

        {
            let _guard = self.lock.lock().await;
            let mut file = self.load_or_init();
            file.models = selection.clone();
            self.write_file(&file);
        }

        self.cache.invalidate_all();
        info!(
            "runtime models updated: chat={}/{} embedding={}/{}",
            selection.chat_provider,
            selection.chat_model,
            selection.embedding_provider,
            selection.embedding_model
        );
        Ok(selection)
    }

    /// Validate and persist a new retrieval configuration; invalidates the
    /// vector-index handle only.
    pub async fn set_retrieval(
        &self,
        mut selection: RuntimeRetrieval,
    ) -> AppResult<RuntimeRetrieval> {
        if RetrievalStrategy::parse(&selection.retrieval_strategy).is_none() {
            return Err(AppError::UnsupportedStrategy(
                selection.retrieval_strategy.clone(),
            ));
        }
        if selection.top_k == 0 {
            selection.top_k = self.settings.retrieval.top_k;
        }
        if selection.vector_backend.is_empty() {
            selection.vector_backend = DEFAULT_VECTOR_BACKEND.to_string();
        }

        {
            let _guard = self.lock.lock().await;
            let mut file = self.load_or_init();
            file.rag = Some(selection.clone());
            self.write_file(&file);
        }

        self.cache.invalidate_vector();
        info!(
            "runtime retrieval updated: strategy={} top_k={}",
            selection.retrieval_strategy, selection.top_k
        );
        Ok(selection)
    }

    /// Restore retrieval defaults without touching the model selection.
    pub async fn reset_retrieval(&self) -> RuntimeRetrieval {
        let defaults = self.default_retrieval();
        {
            let _guard = self.lock.lock().await;
            let mut file = self.load_or_init();
            file.rag = Some(defaults.clone());
            self.write_file(&file);
        }
        self.cache.invalidate_vector();
        defaults
    }

    /// Cached embedding client for the active selection.
    pub async fn embedder(&self) -> AppResult<Arc<EmbeddingClient>> {
        if let Some(client) = self.cache.embedding.lock().unwrap().clone() {
            return Ok(client);
        }
        let models = self.models().await;
        let client = Arc::new(EmbeddingClient::new(
            &self.settings,
            &models.embedding_provider,
            &models.embedding_model,
        )?);
        *self.cache.embedding.lock().unwrap() = Some(client.clone());
        Ok(client)
    }

    /// Cached generation client for the active selection.
    pub async fn generator(&self) -> AppResult<Arc<GenerationClient>> {
        if let Some(client) = self.cache.generation.lock().unwrap().clone() {
            return Ok(client);
        }
        let models = self.models().await;
        let client = Arc::new(GenerationClient::new(
            &self.settings,
            &models.chat_provider,
            &models.chat_model,
        )?);
        *self.cache.generation.lock().unwrap() = Some(client.clone());
        Ok(client)
    }

    /// Cached vector-index handle for the active backend.
    pub async fn vector_index(&self, pool: &SqlitePool) -> Arc<dyn VectorIndex> {
        if let Some(index) = self.cache.vector.lock().unwrap().clone() {
            return index;
        }
        // Only the SQLite backend is wired; the backend key stays in the
        // config schema so others can register later.
        let index: Arc<dyn VectorIndex> = Arc::new(SqliteVectorIndex::new(pool.clone()));
        *self.cache.vector.lock().unwrap() = Some(index.clone());
        index
    }
}

/// Check a pending model selection against the probed catalog: providers
/// first (chat, then embedding), then models (chat, then embedding).
fn validate_models(selection: &RuntimeModels, catalog: &ProviderCatalog) -> AppResult<()> {
    if !catalog
        .available_keys
        .iter()
        .any(|k| k == &selection.chat_provider)
    {
        return Err(AppError::InvalidSelection {
            field: "chat_provider",
            message: format!("provider '{}' is not available", selection.chat_provider),
        });
    }
    if !catalog
        .available_keys
        .iter()
        .any(|k| k == &selection.embedding_provider)
    {
        return Err(AppError::InvalidSelection {
            field: "embedding_provider",
            message: format!(
                "provider '{}' is not available",
                selection.embedding_provider
            ),
        });
    }
    if !catalog.chat_models.iter().any(|m| m == &selection.chat_model) {
        return Err(AppError::InvalidSelection {
            field: "chat_model",
            message: format!(
                "model '{}' not found for provider '{}'",
                selection.chat_model, selection.chat_provider
            ),
        });
    }
    if !catalog
        .embedding_models
        .iter()
        .any(|m| m == &selection.embedding_model)
    {
        return Err(AppError::InvalidSelection {
            field: "embedding_model",
            message: format!(
                "model '{}' not found for provider '{}'",
                selection.embedding_model, selection.embedding_provider
            ),
        });
    }
    Ok(())
}
