//! Retrieval engine.
//!
//! Executes one of the configured similarity strategies against the vector
//! index and enriches hits with relational metadata. Results are ordered
//! best-first within a single call; no ordering is guaranteed across calls
//! (the index may have been mutated in between).

use std::collections::HashMap;

use sqlx::SqlitePool;
use tracing::warn;

use crate::embedding::Embedder;
use crate::error::AppResult;
use crate::models::RetrievedPassage;
use crate::runtime::RuntimeRetrieval;
use crate::vector::{cosine_similarity, VectorHit, VectorIndex};

pub const DEFAULT_FETCH_K: usize = 20;
pub const DEFAULT_LAMBDA_MULT: f64 = 0.5;

/// The closed set of retrieval strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStrategy {
    Similarity,
    SimilarityScoreThreshold,
    Mmr,
}

impl RetrievalStrategy {
    pub const ALL: [RetrievalStrategy; 3] = [
        RetrievalStrategy::Similarity,
        RetrievalStrategy::SimilarityScoreThreshold,
        RetrievalStrategy::Mmr,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "similarity" => Some(Self::Similarity),
            "similarity_score_threshold" => Some(Self::SimilarityScoreThreshold),
            "mmr" => Some(Self::Mmr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Similarity => "similarity",
            Self::SimilarityScoreThreshold => "similarity_score_threshold",
            Self::Mmr => "mmr",
        }
    }
}

/// Retrieve the best passages for `query_text` using the active strategy.
///
/// `document_ids` restricts the index search; `None` searches everything.
/// An unrecognized strategy name falls back to plain similarity.
pub async fn retrieve(
    pool: &SqlitePool,
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    rag: &RuntimeRetrieval,
    query_text: &str,
    k: usize,
    document_ids: Option<&[i64]>,
) -> AppResult<Vec<RetrievedPassage>> {
    let strategy = RetrievalStrategy::parse(&rag.retrieval_strategy).unwrap_or_else(|| {
        warn!(
            "unrecognized retrieval strategy '{}'; falling back to similarity",
            rag.retrieval_strategy
        );
        RetrievalStrategy::Similarity
    });

    let query_vec = embedder.embed_query(query_text).await?;

    let scored: Vec<(VectorHit, Option<f64>)> = match strategy {
        RetrievalStrategy::Similarity => {
            let hits = index.query(&query_vec, k, document_ids).await?;
            hits.into_iter()
                .map(|h| {
                    let score = h.score;
                    (h, Some(score))
                })
                .collect()
        }
        RetrievalStrategy::SimilarityScoreThreshold => {
            // Oversample, filter, truncate. Never pad back up to k.
            let hits = index.query(&query_vec, k * 2, document_ids).await?;
            let threshold = rag.score_threshold.unwrap_or(0.0);
            hits.into_iter()
                .filter(|h| h.score >= threshold)
                .take(k)
                .map(|h| {
                    let score = h.score;
                    (h, Some(score))
                })
                .collect()
        }
        RetrievalStrategy::Mmr => {
            let fetch_k = rag.fetch_k.unwrap_or(DEFAULT_FETCH_K).max(k);
            let lambda = rag.lambda_mult.unwrap_or(DEFAULT_LAMBDA_MULT);
            let candidates = index.query(&query_vec, fetch_k, document_ids).await?;
            mmr_select(&candidates, k, lambda)
                .into_iter()
                // MMR has no native similarity score to report.
                .map(|i| (candidates[i].clone(), None))
                .collect()
        }
    };

    enrich_with_documents(pool, scored).await
}

/// Maximal marginal relevance: pick `k` candidate indices balancing query
/// relevance against diversity from already-selected items. `lambda` = 1.0
/// is pure relevance, 0.0 pure diversity. Candidates arrive best-first with
/// their query similarity in `score`.
pub fn mmr_select(candidates: &[VectorHit], k: usize, lambda: f64) -> Vec<usize> {
    let mut selected: Vec<usize> = Vec::new();
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_value = f64::NEG_INFINITY;

        for (pos, &idx) in remaining.iter().enumerate() {
            let relevance = candidates[idx].score;
            let max_similarity = selected
                .iter()
                .map(|&s| {
                    cosine_similarity(&candidates[idx].embedding, &candidates[s].embedding) as f64
                })
                .fold(f64::NEG_INFINITY, f64::max);
            let redundancy = if selected.is_empty() {
                0.0
            } else {
                max_similarity
            };

            let value = lambda * relevance - (1.0 - lambda) * redundancy;
            if value > best_value {
                best_value = value;
                best_pos = pos;
            }
        }

        selected.push(remaining.remove(best_pos));
    }

    selected
}

/// Attach the owning document's filename to each hit. A hit whose document
/// no longer resolves (deleted document, stale index) passes through with
/// an empty name so the caller can detect the inconsistency.
async fn enrich_with_documents(
    pool: &SqlitePool,
    scored: Vec<(VectorHit, Option<f64>)>,
) -> AppResult<Vec<RetrievedPassage>> {
    let mut filenames: HashMap<i64, Option<String>> = HashMap::new();
    let mut out = Vec::with_capacity(scored.len());

    for (hit, score) in scored {
        let filename = match filenames.get(&hit.document_id) {
            Some(cached) => cached.clone(),
            None => {
                let name: Option<String> =
                    sqlx::query_scalar("SELECT filename FROM documents WHERE id = ?")
                        .bind(hit.document_id)
                        .fetch_optional(pool)
                        .await
                        .map_err(|e| crate::error::AppError::Unhandled(e.into()))?;
                filenames.insert(hit.document_id, name.clone());
                name
            }
        };

        if filename.is_none() {
            warn!(
                "vector hit references unknown document {} (stale index?)",
                hit.document_id
            );
        }

        out.push(RetrievedPassage {
            passage_id: hit.passage_id,
            document_id: hit.document_id,
            filename: filename.unwrap_or_default(),
            text: hit.content,
            section_heading: hit.section_heading,
            page_number: hit.page_number,
            score,
        });
    }

    Ok(out)
}
