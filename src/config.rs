use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for the database, uploaded files, and runtime config.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_file_mb")]
    pub max_file_mb: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Chunk budget: characters for character-based strategies, whitespace
    /// tokens for the token-window strategy.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    /// Falls back to the OPENAI_API_KEY environment variable when unset.
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Timeout for unary provider calls (embeddings, model listings).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum silence between streamed generation fragments.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./storage")
}
fn default_max_file_mb() -> u64 {
    50
}
fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    400
}
fn default_top_k() -> usize {
    12
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_chat_model() -> String {
    "gemma3:4b".to_string()
}
fn default_embedding_model() -> String {
    "embeddinggemma:latest".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_stream_idle_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    5
}
fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            max_file_mb: default_max_file_mb(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: default_ollama_base_url(),
            openai_base_url: default_openai_base_url(),
            openai_api_key: None,
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            request_timeout_secs: default_request_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            providers: ProvidersConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        self.storage.root.join("docquery.sqlite")
    }

    pub fn file_dir(&self) -> PathBuf {
        self.storage.root.join("files")
    }

    pub fn runtime_config_path(&self) -> PathBuf {
        self.storage.root.join("runtime_config.json")
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.storage.max_file_mb * 1024 * 1024
    }

    pub fn openai_api_key(&self) -> Option<String> {
        self.providers
            .openai_api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty())
    }
}

/// Load settings from a TOML file. A missing file yields the built-in
/// defaults so `dq` works out of the box; a present-but-invalid file is an
/// error.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let settings: Settings =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if settings.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }

    if settings.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if settings.storage.max_file_mb == 0 {
        anyhow::bail!("storage.max_file_mb must be >= 1");
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let settings = load_settings(Path::new("/nonexistent/dq.toml")).unwrap();
        assert_eq!(settings.chunking.chunk_size, 1024);
        assert_eq!(settings.chunking.chunk_overlap, 400);
        assert_eq!(settings.retrieval.top_k, 12);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("dq.toml");
        std::fs::write(&path, "[chunking]\nchunk_size = 0\n").unwrap();
        assert!(load_settings(&path).is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("dq.toml");
        std::fs::write(&path, "[retrieval]\ntop_k = 5\n").unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.retrieval.top_k, 5);
        assert_eq!(settings.providers.ollama_base_url, "http://localhost:11434");
    }
}
