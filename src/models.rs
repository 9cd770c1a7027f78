//! Core data models used throughout DocQuery.
//!
//! These types represent the documents, passages, and retrieval results that
//! flow through the ingestion and answer pipeline, plus the provider
//! descriptors surfaced by the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized document stored in SQLite. One document owns zero or more
/// passages; a document with zero passages is unsearchable, not erroneous.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub filename: String,
    pub filepath: String,
    pub filetype: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    /// True when the heavyweight binary extractor produced the markdown,
    /// false when the raw bytes were decoded as text.
    pub converted_with_extractor: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_markdown: Option<String>,
}

/// A passage (chunk) of a document's normalized markdown. Immutable once
/// created; re-ingestion deletes and recreates all passages for a document.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub id: i64,
    pub document_id: i64,
    pub passage_index: i64,
    pub content: String,
    pub section_heading: Option<String>,
    pub page_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A passage candidate produced by the chunking strategy selector, before it
/// has been assigned a database id.
#[derive(Debug, Clone, PartialEq)]
pub struct PassageDraft {
    pub text: String,
    pub section_heading: Option<String>,
    pub page_number: Option<i64>,
}

/// A scored hit returned by the retrieval engine, best-first.
///
/// `score` is `None` for strategies that produce no native similarity score
/// (MMR); callers must not conflate that with a numeric zero.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedPassage {
    pub passage_id: i64,
    pub document_id: i64,
    pub filename: String,
    pub text: String,
    pub section_heading: Option<String>,
    pub page_number: Option<i64>,
    pub score: Option<f64>,
}

/// Provider kind: answer generation or text embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Llm,
    Embedding,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Llm => write!(f, "llm"),
            ProviderKind::Embedding => write!(f, "embedding"),
        }
    }
}

/// Read-only description of an installed provider, derived at call time.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
}

/// Read-only description of a model a provider currently offers.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
}

/// An uploaded file as handed to the ingestion pipeline. Transport concerns
/// (multipart parsing, CLI file reads) happen before this point.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}
