//! End-to-end pipeline tests: ingest → retrieve → reingest → remove,
//! driven by a deterministic embedder so no model server is required.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use docquery::chunking::ChunkingStrategy;
use docquery::config::Settings;
use docquery::convert::ExtractingConverter;
use docquery::db;
use docquery::embedding::Embedder;
use docquery::error::{AppError, AppResult};
use docquery::ingest;
use docquery::migrate;
use docquery::models::Upload;
use docquery::retrieval::{self, RetrievalStrategy};
use docquery::runtime::RuntimeRetrieval;
use docquery::store;
use docquery::vector::SqliteVectorIndex;

const DIMS: usize = 64;

/// Deterministic bag-of-words embedder: token hashes accumulate into a
/// fixed-size vector, normalized to unit length. Texts sharing tokens get
/// high cosine similarity, which is all retrieval needs.
struct HashEmbedder;

fn embed_text(text: &str) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut v = vec![0f32; DIMS];
    for token in text.to_lowercase().split_whitespace() {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        v[(hasher.finish() % DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    async fn embed_texts(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

struct TestEnv {
    _tmp: tempfile::TempDir,
    settings: Settings,
    pool: SqlitePool,
    index: SqliteVectorIndex,
}

async fn setup() -> TestEnv {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.storage.root = tmp.path().to_path_buf();

    let pool = db::connect(&settings).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let index = SqliteVectorIndex::new(pool.clone());

    TestEnv {
        _tmp: tmp,
        settings,
        pool,
        index,
    }
}

fn txt_upload(name: &str, body: &str) -> Upload {
    Upload {
        filename: name.to_string(),
        content_type: "text/plain".to_string(),
        bytes: body.as_bytes().to_vec(),
    }
}

fn rag(strategy: RetrievalStrategy) -> RuntimeRetrieval {
    RuntimeRetrieval {
        retrieval_strategy: strategy.as_str().to_string(),
        top_k: 5,
        score_threshold: None,
        fetch_k: Some(20),
        lambda_mult: Some(0.5),
        chunking_method: None,
        vector_backend: "sqlite".to_string(),
    }
}

async fn ingest_text(
    env: &TestEnv,
    name: &str,
    body: &str,
) -> AppResult<(docquery::models::Document, usize)> {
    ingest::ingest(
        &env.pool,
        &env.settings,
        &ExtractingConverter,
        &HashEmbedder,
        &env.index,
        txt_upload(name, body),
        ChunkingStrategy::RecursiveCharacter,
    )
    .await
}

async fn vector_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM vector_records")
        .fetch_one(pool)
        .await
        .unwrap()
}

// A three-page plain-text document; pages are separated by form feeds the
// way the PDF extractor emits them.
const THREE_PAGES: &str = "Introduction to alpaca farming and pasture rotation basics.\u{0c}\
The secret phrase zanzibar treacle appears only here in the middle.\u{0c}\
Closing remarks about wool shearing schedules and market prices.";

#[tokio::test]
async fn ingest_three_page_file_and_cite_page_two() {
    let env = setup().await;

    let (document, passage_count) = ingest_text(&env, "guide.txt", THREE_PAGES).await.unwrap();
    assert!(passage_count > 0);
    // Plain text goes through the raw-text path, not the extractor.
    assert!(!document.converted_with_extractor);
    assert_eq!(document.raw_markdown.as_deref(), Some(THREE_PAGES));

    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &rag(RetrievalStrategy::Similarity),
        "where does the phrase zanzibar treacle appear?",
        3,
        None,
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].page_number, Some(2));
    assert_eq!(hits[0].filename, "guide.txt");
    assert!(hits[0].text.contains("zanzibar treacle"));
}

#[tokio::test]
async fn similarity_results_are_bounded_and_ordered() {
    let env = setup().await;
    ingest_text(&env, "a.txt", "Rust systems programming with ownership and borrowing.")
        .await
        .unwrap();
    ingest_text(&env, "b.txt", "Gardening tips for tomato seedlings in spring.")
        .await
        .unwrap();
    ingest_text(&env, "c.txt", "Programming languages and their memory models.")
        .await
        .unwrap();

    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &rag(RetrievalStrategy::Similarity),
        "programming with memory ownership",
        2,
        None,
    )
    .await
    .unwrap();

    assert!(hits.len() <= 2);
    for pair in hits.windows(2) {
        assert!(pair[0].score.unwrap() >= pair[1].score.unwrap());
    }
}

#[tokio::test]
async fn threshold_strategy_never_pads() {
    let env = setup().await;
    ingest_text(&env, "a.txt", "Completely unrelated text about medieval cartography.")
        .await
        .unwrap();
    ingest_text(&env, "b.txt", "The quick brown fox jumps over the lazy dog.")
        .await
        .unwrap();

    let mut config = rag(RetrievalStrategy::SimilarityScoreThreshold);
    config.score_threshold = Some(0.7);

    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &config,
        "the quick brown fox jumps over the lazy dog",
        5,
        None,
    )
    .await
    .unwrap();

    // Fewer than k may survive; none below the threshold.
    assert!(hits.len() < 5);
    for hit in &hits {
        assert!(hit.score.unwrap() >= 0.7, "score {} below threshold", hit.score.unwrap());
    }
}

#[tokio::test]
async fn mmr_strategy_reports_no_score() {
    let env = setup().await;
    ingest_text(&env, "a.txt", "Notes on sourdough starters and hydration.")
        .await
        .unwrap();
    ingest_text(&env, "b.txt", "More notes on sourdough baking temperatures.")
        .await
        .unwrap();

    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &rag(RetrievalStrategy::Mmr),
        "sourdough notes",
        2,
        None,
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    for hit in &hits {
        assert!(hit.score.is_none(), "mmr must not report a similarity score");
    }
}

#[tokio::test]
async fn unrecognized_strategy_falls_back_to_similarity() {
    let env = setup().await;
    ingest_text(&env, "a.txt", "Falcons hunt at remarkable speeds.")
        .await
        .unwrap();

    let mut config = rag(RetrievalStrategy::Similarity);
    config.retrieval_strategy = "hyperspace".to_string();

    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &config,
        "falcons hunt speeds",
        3,
        None,
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    assert!(hits[0].score.is_some());
}

#[tokio::test]
async fn document_filter_restricts_results() {
    let env = setup().await;
    let (doc_a, _) = ingest_text(&env, "a.txt", "Shared topic text about orchards.")
        .await
        .unwrap();
    let (doc_b, _) = ingest_text(&env, "b.txt", "Shared topic text about orchards too.")
        .await
        .unwrap();

    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &rag(RetrievalStrategy::Similarity),
        "orchards topic",
        10,
        Some(&[doc_a.id]),
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    for hit in &hits {
        assert_eq!(hit.document_id, doc_a.id);
        assert_ne!(hit.document_id, doc_b.id);
    }
}

#[tokio::test]
async fn reingest_replaces_all_passages_and_vectors() {
    let env = setup().await;
    let (document, _) = ingest_text(&env, "doc.txt", THREE_PAGES).await.unwrap();

    let old_ids: Vec<i64> = store::list_passages(&env.pool, document.id)
        .await
        .unwrap()
        .iter()
        .map(|p| p.id)
        .collect();
    assert!(!old_ids.is_empty());

    let (updated, new_count) = ingest::reingest(
        &env.pool,
        &env.settings,
        &ExtractingConverter,
        &HashEmbedder,
        &env.index,
        document.id,
        txt_upload("doc.txt", "Entirely new content after the update."),
        ChunkingStrategy::RecursiveCharacter,
    )
    .await
    .unwrap();

    assert_eq!(updated.id, document.id);
    assert!(new_count > 0);

    // No vector record may reference a pre-reingestion passage id.
    for old_id in &old_ids {
        let stale: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE passage_id = ?")
                .bind(old_id)
                .fetch_one(&env.pool)
                .await
                .unwrap();
        assert_eq!(stale, 0, "stale vector for old passage {}", old_id);
    }

    let passages = store::list_passages(&env.pool, document.id).await.unwrap();
    assert_eq!(passages.len(), new_count);
    for p in &passages {
        assert!(!old_ids.contains(&p.id));
    }
    assert!(passages.iter().any(|p| p.content.contains("new content")));
}

#[tokio::test]
async fn reingest_unknown_document_is_not_found() {
    let env = setup().await;
    let err = ingest::reingest(
        &env.pool,
        &env.settings,
        &ExtractingConverter,
        &HashEmbedder,
        &env.index,
        4242,
        txt_upload("ghost.txt", "content"),
        ChunkingStrategy::RecursiveCharacter,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn remove_deletes_everything_and_retrieval_forgets() {
    let env = setup().await;
    let (keep, _) = ingest_text(&env, "keep.txt", "Keep this content about lighthouses.")
        .await
        .unwrap();
    let (gone, _) = ingest_text(&env, "gone.txt", "Remove this content about submarines.")
        .await
        .unwrap();

    let filepath = gone.filepath.clone();
    ingest::remove(&env.pool, &env.index, gone.id).await.unwrap();

    assert!(store::get_document(&env.pool, gone.id).await.unwrap().is_none());
    assert!(store::list_passages(&env.pool, gone.id).await.unwrap().is_empty());
    assert!(!std::path::Path::new(&filepath).exists());

    let orphaned: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE document_id = ?")
            .bind(gone.id)
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(orphaned, 0);

    // Subsequent retrieval never returns the removed document's content.
    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &rag(RetrievalStrategy::Similarity),
        "content about submarines",
        10,
        None,
    )
    .await
    .unwrap();
    for hit in &hits {
        assert_eq!(hit.document_id, keep.id);
    }
}

#[tokio::test]
async fn remove_unknown_document_is_not_found() {
    let env = setup().await;
    let err = ingest::remove(&env.pool, &env.index, 999).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn zero_content_ingest_rolls_back_document() {
    let env = setup().await;

    let err = ingest_text(&env, "empty.txt", "   \n  ").await.unwrap_err();
    assert!(matches!(err, AppError::NoContentExtracted));

    // No document row, no passages, no vectors, no stored file left behind.
    assert_eq!(store::count_documents(&env.pool).await.unwrap(), 0);
    assert_eq!(store::count_passages(&env.pool).await.unwrap(), 0);
    assert_eq!(vector_count(&env.pool).await, 0);
    assert!(!env.settings.file_dir().join("empty.txt").exists());
}

#[tokio::test]
async fn unsupported_upload_type_is_rejected() {
    let env = setup().await;
    let upload = Upload {
        filename: "img.png".to_string(),
        content_type: "image/png".to_string(),
        bytes: vec![1, 2, 3],
    };
    let err = ingest::ingest(
        &env.pool,
        &env.settings,
        &ExtractingConverter,
        &HashEmbedder,
        &env.index,
        upload,
        ChunkingStrategy::RecursiveCharacter,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::UnsupportedFileType(_)));
    assert_eq!(store::count_documents(&env.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn stale_index_hit_passes_through_with_empty_name() {
    let env = setup().await;
    let (document, _) = ingest_text(&env, "stale.txt", "Text about glaciers moving slowly.")
        .await
        .unwrap();

    // Simulate inconsistency: drop the document row but leave the index.
    store::delete_passages(&env.pool, document.id).await.unwrap();
    store::delete_document(&env.pool, document.id).await.unwrap();

    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &rag(RetrievalStrategy::Similarity),
        "glaciers moving",
        5,
        None,
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].filename, "");
    assert_eq!(hits[0].document_id, document.id);
}

#[tokio::test]
async fn markdown_header_chunks_carry_section_headings() {
    let env = setup().await;
    let body = "# Manual\nGeneral intro paragraph.\n## Installation\nRun the installer twice.";
    let (document, count) = ingest::ingest(
        &env.pool,
        &env.settings,
        &ExtractingConverter,
        &HashEmbedder,
        &env.index,
        txt_upload("manual.md", body),
        ChunkingStrategy::MarkdownHeader,
    )
    .await
    .unwrap();

    assert_eq!(count, 2);
    let passages = store::list_passages(&env.pool, document.id).await.unwrap();
    assert_eq!(passages[0].section_heading.as_deref(), Some("Manual"));
    assert_eq!(passages[1].section_heading.as_deref(), Some("Installation"));

    let hits = retrieval::retrieve(
        &env.pool,
        &env.index,
        &HashEmbedder,
        &rag(RetrievalStrategy::Similarity),
        "run the installer",
        1,
        None,
    )
    .await
    .unwrap();
    assert_eq!(hits[0].section_heading.as_deref(), Some("Installation"));
}
