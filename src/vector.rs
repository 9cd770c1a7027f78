//! Vector index adapter.
//!
//! Defines the [`VectorIndex`] trait consumed by the ingestion pipeline and
//! retrieval engine, plus the default [`SqliteVectorIndex`] backend that
//! stores embeddings as little-endian f32 blobs and ranks by cosine
//! similarity in process.
//!
//! The index is keyed by passage id and denormalizes the passage text and
//! citation metadata, so retrieval can serve hits without consulting the
//! passages table. The consistency contract (a vector record exists iff its
//! passage exists) is enforced by the ingestion pipeline's operation
//! ordering, not by this adapter.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

/// One record to upsert into the index.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub passage_id: i64,
    pub document_id: i64,
    pub content: String,
    pub section_heading: Option<String>,
    pub page_number: Option<i64>,
    pub model: String,
    pub embedding: Vec<f32>,
}

/// A scored nearest-neighbor hit. The candidate embedding is included so
/// diversity-aware strategies (MMR) can compare hits against each other.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub passage_id: i64,
    pub document_id: i64,
    pub content: String,
    pub section_heading: Option<String>,
    pub page_number: Option<i64>,
    pub score: f64,
    pub embedding: Vec<f32>,
}

/// Keyed upsert/delete/query over embedded vectors with an optional
/// document-id metadata filter.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;
    async fn delete_by_document(&self, document_id: i64) -> Result<()>;
    /// Top-`k` records by cosine similarity, best-first. `document_ids`
    /// restricts the search; `None` searches the whole index.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<VectorHit>>;
}

/// SQLite-backed index: embeddings live next to the relational store and
/// similarity is computed in process.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            let blob = vec_to_blob(&record.embedding);
            sqlx::query(
                r#"
                INSERT INTO vector_records
                    (passage_id, document_id, content, section_heading, page_number, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(passage_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    content = excluded.content,
                    section_heading = excluded.section_heading,
                    page_number = excluded.page_number,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(record.passage_id)
            .bind(record.document_id)
            .bind(&record.content)
            .bind(&record.section_heading)
            .bind(record.page_number)
            .bind(&record.model)
            .bind(record.embedding.len() as i64)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_document(&self, document_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vector_records WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<VectorHit>> {
        // Fetch candidate rows and rank by cosine similarity in Rust. The
        // document filter is pushed into SQL; similarity is not.
        let rows = match document_ids {
            Some(ids) if !ids.is_empty() => {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql = format!(
                    "SELECT * FROM vector_records WHERE document_id IN ({})",
                    placeholders
                );
                let mut query = sqlx::query(&sql);
                for id in ids {
                    query = query.bind(id);
                }
                query.fetch_all(&self.pool).await?
            }
            _ => {
                sqlx::query("SELECT * FROM vector_records")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let embedding = blob_to_vec(&blob);
                let score = cosine_similarity(vector, &embedding) as f64;
                VectorHit {
                    passage_id: row.get("passage_id"),
                    document_id: row.get("document_id"),
                    content: row.get("content"),
                    section_heading: row.get("section_heading"),
                    page_number: row.get("page_number"),
                    score,
                    embedding,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);

        Ok(hits)
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty() {
        let sim = cosine_similarity(&[], &[]);
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        let sim = cosine_similarity(&a, &b);
        assert_eq!(sim, 0.0);
    }
}
