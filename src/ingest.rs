//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow: upload storage → conversion → chunking →
//! relational persistence → embedding → vector indexing, keeping the
//! relational store and the vector index consistent. The ordering contract:
//! vector records for a document are always deleted before its passages,
//! and inserted only after each passage row has a durable id. A crash
//! mid-operation can leave a passage without a vector, never a vector
//! without a passage.
//!
//! Concurrent re-ingests of the same document id are not serialized here;
//! callers that need that must hold a per-document lock.

use sqlx::SqlitePool;
use tracing::info;

use crate::chunking::{self, ChunkingStrategy};
use crate::config::Settings;
use crate::convert::DocumentConverter;
use crate::embedding::Embedder;
use crate::error::{AppError, AppResult};
use crate::models::{Document, PassageDraft, Upload};
use crate::storage;
use crate::store;
use crate::vector::{VectorIndex, VectorRecord};

/// Ingest a new upload: persist the file, create the document row, convert,
/// chunk, embed, and index. A zero-passage conversion rolls the document
/// back (row and stored file removed) and fails with `NoContentExtracted`.
pub async fn ingest(
    pool: &SqlitePool,
    settings: &Settings,
    converter: &dyn DocumentConverter,
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    upload: Upload,
    chunking_method: ChunkingStrategy,
) -> AppResult<(Document, usize)> {
    let (path, filetype) = storage::save_upload(settings, &upload)?;
    let path_str = path.to_string_lossy().into_owned();

    let document = store::create_document(
        pool,
        &upload.filename,
        &path_str,
        &filetype,
        upload.bytes.len() as i64,
    )
    .await
    .map_err(AppError::Unhandled)?;

    match process_passages(
        pool,
        settings,
        converter,
        embedder,
        index,
        document.id,
        &path_str,
        &filetype,
        chunking_method,
    )
    .await
    {
        Ok(count) => {
            let document = store::get_document(pool, document.id)
                .await
                .map_err(AppError::Unhandled)?
                .ok_or_else(|| AppError::NotFound("document".to_string()))?;
            info!(
                "ingested document {} ({}, {} passages)",
                document.id, document.filename, count
            );
            Ok((document, count))
        }
        Err(AppError::NoContentExtracted) => {
            // Roll back: never leave a passage-less document behind as if
            // the ingest had completed.
            store::delete_document(pool, document.id)
                .await
                .map_err(AppError::Unhandled)?;
            storage::remove_stored_file(&path_str);
            Err(AppError::NoContentExtracted)
        }
        Err(other) => Err(other),
    }
}

/// Replace a document's upload and rebuild its passages and vectors.
///
/// The delete phases run in consistency order: vectors, then passages, then
/// the old stored file. If conversion or indexing of the new upload fails,
/// the document keeps its updated metadata with zero passages; callers
/// treat such a document as unsearchable.
pub async fn reingest(
    pool: &SqlitePool,
    settings: &Settings,
    converter: &dyn DocumentConverter,
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    document_id: i64,
    upload: Upload,
    chunking_method: ChunkingStrategy,
) -> AppResult<(Document, usize)> {
    let existing = store::get_document(pool, document_id)
        .await
        .map_err(AppError::Unhandled)?
        .ok_or_else(|| AppError::NotFound("document".to_string()))?;

    index
        .delete_by_document(document_id)
        .await
        .map_err(AppError::Unhandled)?;
    store::delete_passages(pool, document_id)
        .await
        .map_err(AppError::Unhandled)?;
    storage::remove_stored_file(&existing.filepath);

    let (path, filetype) = storage::save_upload(settings, &upload)?;
    let path_str = path.to_string_lossy().into_owned();
    store::update_document_file(
        pool,
        document_id,
        &upload.filename,
        &path_str,
        &filetype,
        upload.bytes.len() as i64,
    )
    .await
    .map_err(AppError::Unhandled)?;

    let count = process_passages(
        pool,
        settings,
        converter,
        embedder,
        index,
        document_id,
        &path_str,
        &filetype,
        chunking_method,
    )
    .await?;

    let document = store::get_document(pool, document_id)
        .await
        .map_err(AppError::Unhandled)?
        .ok_or_else(|| AppError::NotFound("document".to_string()))?;
    info!(
        "reingested document {} ({}, {} passages)",
        document.id, document.filename, count
    );
    Ok((document, count))
}

/// Delete a document and everything derived from it, in consistency order:
/// vectors, passages, stored file, document row.
pub async fn remove(
    pool: &SqlitePool,
    index: &dyn VectorIndex,
    document_id: i64,
) -> AppResult<()> {
    let existing = store::get_document(pool, document_id)
        .await
        .map_err(AppError::Unhandled)?
        .ok_or_else(|| AppError::NotFound("document".to_string()))?;

    index
        .delete_by_document(document_id)
        .await
        .map_err(AppError::Unhandled)?;
    store::delete_passages(pool, document_id)
        .await
        .map_err(AppError::Unhandled)?;
    storage::remove_stored_file(&existing.filepath);
    store::delete_document(pool, document_id)
        .await
        .map_err(AppError::Unhandled)?;

    info!("removed document {} ({})", document_id, existing.filename);
    Ok(())
}

/// Convert, chunk, persist passages, embed, and index one document.
/// Returns the passage count or `NoContentExtracted` when chunking yields
/// nothing.
#[allow(clippy::too_many_arguments)]
async fn process_passages(
    pool: &SqlitePool,
    settings: &Settings,
    converter: &dyn DocumentConverter,
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    document_id: i64,
    path: &str,
    filetype: &str,
    chunking_method: ChunkingStrategy,
) -> AppResult<usize> {
    let converted = converter.to_markdown(std::path::Path::new(path), filetype);
    let drafts = chunk_markdown(
        &converted.markdown,
        chunking_method,
        settings.chunking.chunk_size,
        settings.chunking.chunk_overlap,
    );

    if drafts.is_empty() {
        return Err(AppError::NoContentExtracted);
    }

    // Passage rows first: vector records may only reference durable ids.
    let mut inserted: Vec<(i64, PassageDraft)> = Vec::with_capacity(drafts.len());
    for (idx, draft) in drafts.into_iter().enumerate() {
        let passage_id = store::insert_passage(pool, document_id, idx as i64, &draft)
            .await
            .map_err(AppError::Unhandled)?;
        inserted.push((passage_id, draft));
    }

    let texts: Vec<String> = inserted.iter().map(|(_, d)| d.text.clone()).collect();
    let vectors = embedder.embed_texts(&texts).await?;

    let records: Vec<VectorRecord> = inserted
        .iter()
        .zip(vectors)
        .map(|((passage_id, draft), embedding)| VectorRecord {
            passage_id: *passage_id,
            document_id,
            content: draft.text.clone(),
            section_heading: draft.section_heading.clone(),
            page_number: draft.page_number,
            model: embedder.model_name().to_string(),
            embedding,
        })
        .collect();

    index.upsert(&records).await.map_err(AppError::Unhandled)?;

    store::set_document_conversion(
        pool,
        document_id,
        converted.used_extractor,
        &converted.markdown,
    )
    .await
    .map_err(AppError::Unhandled)?;

    Ok(inserted.len())
}

/// Chunk normalized markdown, attributing passages to pages when the text
/// carries form-feed page breaks (as the PDF extractor emits). Single-page
/// input produces passages without page numbers.
pub fn chunk_markdown(
    markdown: &str,
    strategy: ChunkingStrategy,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<PassageDraft> {
    if !markdown.contains('\u{0c}') {
        return chunking::split(markdown, strategy, chunk_size, chunk_overlap);
    }

    let mut drafts = Vec::new();
    for (page_idx, page) in markdown.split('\u{0c}').enumerate() {
        for mut draft in chunking::split(page, strategy, chunk_size, chunk_overlap) {
            draft.page_number = Some(page_idx as i64 + 1);
            drafts.push(draft);
        }
    }
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_page_text_has_no_page_numbers() {
        let drafts = chunk_markdown("just one page of text", ChunkingStrategy::Token, 10, 0);
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].page_number.is_none());
    }

    #[test]
    fn form_feeds_assign_one_based_page_numbers() {
        let text = "page one text\u{0c}page two text\u{0c}page three text";
        let drafts = chunk_markdown(text, ChunkingStrategy::Token, 10, 0);
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].page_number, Some(1));
        assert_eq!(drafts[1].page_number, Some(2));
        assert_eq!(drafts[2].page_number, Some(3));
    }

    #[test]
    fn empty_pages_are_skipped() {
        let text = "content\u{0c}\u{0c}more content";
        let drafts = chunk_markdown(text, ChunkingStrategy::Token, 10, 0);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[1].page_number, Some(3));
    }
}
