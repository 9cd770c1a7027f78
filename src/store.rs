//! Relational persistence for documents and passages.
//!
//! Timestamps are stored as unix seconds. Passage ids are assigned by
//! SQLite's rowid allocator at insert time, which is what makes the
//! "vector records only after a durable passage id" ordering possible.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{Document, Passage, PassageDraft};

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        filename: row.get("filename"),
        filepath: row.get("filepath"),
        filetype: row.get("filetype"),
        size_bytes: row.get("size_bytes"),
        created_at: timestamp_to_datetime(row.get("created_at")),
        updated_at: timestamp_to_datetime(row.get("updated_at")),
        deleted: row.get::<i64, _>("deleted") != 0,
        converted_with_extractor: row.get::<i64, _>("converted_with_extractor") != 0,
        raw_markdown: row.get("raw_markdown"),
    }
}

pub async fn create_document(
    pool: &SqlitePool,
    filename: &str,
    filepath: &str,
    filetype: &str,
    size_bytes: i64,
) -> Result<Document> {
    let now = Utc::now().timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO documents (filename, filepath, filetype, size_bytes, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(filename)
    .bind(filepath)
    .bind(filetype)
    .bind(size_bytes)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    Ok(Document {
        id,
        filename: filename.to_string(),
        filepath: filepath.to_string(),
        filetype: filetype.to_string(),
        size_bytes,
        created_at: timestamp_to_datetime(now),
        updated_at: timestamp_to_datetime(now),
        deleted: false,
        converted_with_extractor: false,
        raw_markdown: None,
    })
}

pub async fn get_document(pool: &SqlitePool, id: i64) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(row_to_document))
}

pub async fn list_documents(pool: &SqlitePool) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents WHERE deleted = 0 ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(row_to_document).collect())
}

/// Update the file-derived fields after a re-ingest replaced the upload.
pub async fn update_document_file(
    pool: &SqlitePool,
    id: i64,
    filename: &str,
    filepath: &str,
    filetype: &str,
    size_bytes: i64,
) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE documents
        SET filename = ?, filepath = ?, filetype = ?, size_bytes = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(filename)
    .bind(filepath)
    .bind(filetype)
    .bind(size_bytes)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_document_conversion(
    pool: &SqlitePool,
    id: i64,
    converted_with_extractor: bool,
    raw_markdown: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE documents SET converted_with_extractor = ?, raw_markdown = ? WHERE id = ?",
    )
    .bind(converted_with_extractor as i64)
    .bind(raw_markdown)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_document(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Insert one passage and return its durably assigned id.
pub async fn insert_passage(
    pool: &SqlitePool,
    document_id: i64,
    passage_index: i64,
    draft: &PassageDraft,
) -> Result<i64> {
    let now = Utc::now().timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO passages (document_id, passage_index, content, section_heading, page_number, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(document_id)
    .bind(passage_index)
    .bind(&draft.text)
    .bind(&draft.section_heading)
    .bind(draft.page_number)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn delete_passages(pool: &SqlitePool, document_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM passages WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn list_passages(pool: &SqlitePool, document_id: i64) -> Result<Vec<Passage>> {
    let rows =
        sqlx::query("SELECT * FROM passages WHERE document_id = ? ORDER BY passage_index")
            .bind(document_id)
            .fetch_all(pool)
            .await?;

    let passages = rows
        .iter()
        .map(|row| Passage {
            id: row.get("id"),
            document_id: row.get("document_id"),
            passage_index: row.get("passage_index"),
            content: row.get("content"),
            section_heading: row.get("section_heading"),
            page_number: row.get("page_number"),
            created_at: timestamp_to_datetime(row.get("created_at")),
        })
        .collect();

    Ok(passages)
}

pub async fn count_documents(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE deleted = 0")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_passages(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
