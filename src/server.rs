//! HTTP API server.
//!
//! Exposes the ingestion, retrieval, provider, and configuration surfaces
//! over JSON, plus the streaming answer endpoint.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Upload and ingest a document (multipart) |
//! | `GET`  | `/files` | List documents |
//! | `PUT`  | `/file/{id}` | Replace a document's upload and re-ingest |
//! | `DELETE` | `/file/{id}` | Delete a document and its passages/vectors |
//! | `GET`  | `/file/{id}/chunks` | List a document's passages |
//! | `POST` | `/query` | Ask a question; answer streams as SSE |
//! | `GET`  | `/providers/{kind}` | List available providers |
//! | `GET`  | `/providers/{kind}/{key}/models` | Live model listing |
//! | `GET/POST` | `/providers/selection` | Get/set active models |
//! | `GET/POST` | `/providers/rag/selection` | Get/set retrieval config |
//! | `POST` | `/providers/rag/reset` | Restore retrieval defaults |
//! | `GET`  | `/providers/rag/options` | Enumerate strategies/backends |
//! | `GET`  | `/stats` | Document/passage counts |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Streaming protocol
//!
//! `POST /query` responds with a text event stream:
//!
//! 1. `event: context` — JSON array of `{chunk, citation}` objects.
//! 2. `event: start` — generation begins.
//! 3. Payload-only `data:` frames, each `{"raw": "...", "cleaned": "..."}`.
//! 4. On failure after `start`: `event: error` with
//!    `{code, message, correlation_id, hint?}`.
//! 5. `event: end` — terminal, emitted exactly once, even after an error.
//!
//! # Error Contract
//!
//! Non-streaming failures render as
//! `{ "error": { "code", "message", "hint"?, "correlation_id" } }` with the
//! status implied by the code. Unhandled errors surface a generic message;
//! the cause chain is logged against the correlation id.

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::answer::{self, AnswerEvent};
use crate::chunking::ChunkingStrategy;
use crate::config::Settings;
use crate::convert::DocumentConverter;
use crate::error::AppError;
use crate::ingest;
use crate::models::{Document, Passage, ProviderKind, RetrievedPassage, Upload};
use crate::providers;
use crate::retrieval::RetrievalStrategy;
use crate::runtime::{RuntimeModels, RuntimeRetrieval, RuntimeStore, DEFAULT_VECTOR_BACKEND};
use crate::store;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pool: SqlitePool,
    pub runtime: Arc<RuntimeStore>,
    pub converter: Arc<dyn DocumentConverter>,
}

/// Start the HTTP server on the configured bind address. Runs until the
/// process terminates.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.settings.server.bind.clone();
    // Multipart bodies must fit the configured upload cap plus form framing.
    let body_limit = state.settings.max_file_bytes() as usize + 1024 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/files", get(handle_list_files))
        .route("/file/{id}", put(handle_reingest))
        .route("/file/{id}", delete(handle_delete_file))
        .route("/file/{id}/chunks", get(handle_file_chunks))
        .route("/query", post(handle_query))
        .route("/providers/selection", get(handle_get_selection))
        .route("/providers/selection", post(handle_set_selection))
        .route("/providers/rag/options", get(handle_rag_options))
        .route("/providers/rag/selection", get(handle_rag_get_selection))
        .route("/providers/rag/selection", post(handle_rag_set_selection))
        .route("/providers/rag/reset", post(handle_rag_reset))
        .route("/providers/{kind}", get(handle_list_providers))
        .route("/providers/{kind}/{key}/models", get(handle_list_models))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state);

    info!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error mapping ============

#[derive(Serialize)]
struct ErrorEnvelope {
    error: crate::error::ErrorBody,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::UnsupportedFileType(_) => StatusCode::BAD_REQUEST,
            AppError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotFound(_) | AppError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidSelection { .. }
            | AppError::UnsupportedStrategy(_)
            | AppError::NoContentExtracted => StatusCode::BAD_REQUEST,
            AppError::EmbeddingFailed(_) | AppError::GenerationFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Unhandled(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = self.to_body();
        error!(
            "request failed [{}] {}: {}",
            body.correlation_id, body.code, self
        );
        (status, Json(ErrorEnvelope { error: body })).into_response()
    }
}

// ============ Ingestion ============

#[derive(Serialize)]
struct IngestResponse {
    file: Document,
    chunks: usize,
}

/// Pull the upload and optional chunking method out of a multipart form.
async fn read_multipart(mut multipart: Multipart) -> Result<(Upload, Option<String>), AppError> {
    let mut upload: Option<Upload> = None;
    let mut chunking_method: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Unhandled(anyhow::anyhow!("reading multipart: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().unwrap_or("").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Unhandled(anyhow::anyhow!("reading upload: {e}")))?;
                upload = Some(Upload {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            Some("chunking_method") => {
                let value = field.text().await.unwrap_or_default();
                if !value.is_empty() {
                    chunking_method = Some(value);
                }
            }
            _ => {}
        }
    }

    let upload = upload
        .ok_or_else(|| AppError::Unhandled(anyhow::anyhow!("multipart field 'file' missing")))?;
    Ok((upload, chunking_method))
}

/// Resolve the effective chunking strategy: explicit request value, then
/// the runtime default, then recursive-character. Unknown names fall back
/// to the default strategy.
async fn resolve_chunking(state: &AppState, requested: Option<String>) -> ChunkingStrategy {
    let name = match requested {
        Some(name) => Some(name),
        None => state.runtime.retrieval().await.chunking_method,
    };
    name.as_deref()
        .and_then(ChunkingStrategy::parse)
        .unwrap_or_default()
}

async fn handle_ingest(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<IngestResponse>, AppError> {
    let (upload, requested_method) = read_multipart(multipart).await?;
    let method = resolve_chunking(&state, requested_method).await;
    info!("ingest: filename={} chunking_method={}", upload.filename, method);

    let embedder = state.runtime.embedder().await?;
    let index = state.runtime.vector_index(&state.pool).await;

    let (file, chunks) = ingest::ingest(
        &state.pool,
        &state.settings,
        state.converter.as_ref(),
        embedder.as_ref(),
        index.as_ref(),
        upload,
        method,
    )
    .await?;

    Ok(Json(IngestResponse { file, chunks }))
}

async fn handle_reingest(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<IngestResponse>, AppError> {
    let (upload, requested_method) = read_multipart(multipart).await?;
    let method = resolve_chunking(&state, requested_method).await;
    info!("reingest: file={} chunking_method={}", id, method);

    let embedder = state.runtime.embedder().await?;
    let index = state.runtime.vector_index(&state.pool).await;

    let (file, chunks) = ingest::reingest(
        &state.pool,
        &state.settings,
        state.converter.as_ref(),
        embedder.as_ref(),
        index.as_ref(),
        id,
        upload,
        method,
    )
    .await?;

    Ok(Json(IngestResponse { file, chunks }))
}

async fn handle_delete_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let index = state.runtime.vector_index(&state.pool).await;
    ingest::remove(&state.pool, index.as_ref(), id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn handle_list_files(
    State(state): State<AppState>,
) -> Result<Json<Vec<Document>>, AppError> {
    let files = store::list_documents(&state.pool)
        .await
        .map_err(AppError::Unhandled)?;
    Ok(Json(files))
}

async fn handle_file_chunks(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Passage>>, AppError> {
    let document = store::get_document(&state.pool, id)
        .await
        .map_err(AppError::Unhandled)?;
    if document.map(|d| d.deleted).unwrap_or(true) {
        return Err(AppError::NotFound("document".to_string()));
    }

    let passages = store::list_passages(&state.pool, id)
        .await
        .map_err(AppError::Unhandled)?;
    Ok(Json(passages))
}

// ============ Query (SSE) ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    document_ids: Option<Vec<i64>>,
}

#[derive(Serialize)]
struct Citation {
    doc_id: String,
    filename: String,
    page: Option<i64>,
    section: Option<String>,
}

#[derive(Serialize)]
struct ContextChunk {
    chunk: String,
    citation: Citation,
}

fn to_context_chunks(retrieved: &[RetrievedPassage]) -> Vec<ContextChunk> {
    retrieved
        .iter()
        .map(|hit| ContextChunk {
            chunk: hit.text.clone(),
            citation: Citation {
                doc_id: hit.document_id.to_string(),
                filename: hit.filename.clone(),
                page: hit.page_number,
                section: hit.section_heading.clone(),
            },
        })
        .collect()
}

fn answer_event_to_sse(event: AnswerEvent) -> Event {
    match event {
        AnswerEvent::Fragment { raw, cleaned } => Event::default()
            .data(serde_json::json!({ "raw": raw, "cleaned": cleaned }).to_string()),
        AnswerEvent::Error(body) => Event::default()
            .event("error")
            .data(serde_json::to_string(&body).unwrap_or_default()),
        AnswerEvent::End => Event::default().event("end"),
    }
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, AppError> {
    if req.query.trim().is_empty() {
        return Err(AppError::InvalidSelection {
            field: "query",
            message: "must not be empty".to_string(),
        });
    }

    let rag = state.runtime.retrieval().await;
    let top_k = req.top_k.unwrap_or(rag.top_k);
    info!("query: top_k={} strategy={}", top_k, rag.retrieval_strategy);

    let embedder = state.runtime.embedder().await?;
    let generator = state.runtime.generator().await?;
    let index = state.runtime.vector_index(&state.pool).await;

    let (rx, retrieved) = answer::run_query(
        &state.pool,
        index.as_ref(),
        embedder.as_ref(),
        generator,
        &rag,
        &req.query,
        top_k,
        req.document_ids.as_deref(),
    )
    .await?;

    let context_payload = serde_json::to_string(&to_context_chunks(&retrieved))
        .map_err(|e| AppError::Unhandled(e.into()))?;

    let preamble = futures::stream::iter(vec![
        Ok(Event::default().event("context").data(context_payload)),
        Ok(Event::default().event("start")),
    ]);
    let body = ReceiverStream::new(rx).map(|event| Ok(answer_event_to_sse(event)));

    Ok(Sse::new(preamble.chain(body)))
}

// ============ Providers & configuration ============

fn parse_kind(kind: &str) -> Result<ProviderKind, AppError> {
    match kind {
        "llm" => Ok(ProviderKind::Llm),
        "embedding" => Ok(ProviderKind::Embedding),
        other => Err(AppError::ProviderNotFound(other.to_string())),
    }
}

async fn handle_list_providers(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let kind = parse_kind(&kind)?;
    let list = providers::available_providers(&state.settings, kind).await;
    Ok(Json(serde_json::json!({ "providers": list })))
}

async fn handle_list_models(
    State(state): State<AppState>,
    Path((kind, key)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let kind = parse_kind(&kind)?;
    let models = providers::list_models_for_provider(&state.settings, &key).await?;
    Ok(Json(serde_json::json!({
        "provider": key,
        "type": kind,
        "models": models,
    })))
}

#[derive(Serialize, Deserialize)]
struct ProviderSelection {
    provider: String,
    model: String,
}

#[derive(Serialize, Deserialize)]
struct SelectionBody {
    llm: ProviderSelection,
    embedding: ProviderSelection,
}

fn selection_body(models: &RuntimeModels) -> SelectionBody {
    SelectionBody {
        llm: ProviderSelection {
            provider: models.chat_provider.clone(),
            model: models.chat_model.clone(),
        },
        embedding: ProviderSelection {
            provider: models.embedding_provider.clone(),
            model: models.embedding_model.clone(),
        },
    }
}

async fn handle_get_selection(State(state): State<AppState>) -> Json<SelectionBody> {
    let models = state.runtime.models().await;
    Json(selection_body(&models))
}

async fn handle_set_selection(
    State(state): State<AppState>,
    Json(body): Json<SelectionBody>,
) -> Result<Json<SelectionBody>, AppError> {
    let updated = state
        .runtime
        .set_models(RuntimeModels {
            chat_provider: body.llm.provider,
            chat_model: body.llm.model,
            embedding_provider: body.embedding.provider,
            embedding_model: body.embedding.model,
        })
        .await?;
    Ok(Json(selection_body(&updated)))
}

async fn handle_rag_options(State(state): State<AppState>) -> Json<serde_json::Value> {
    let defaults = state.runtime.retrieval().await;
    Json(serde_json::json!({
        "retrieval_strategies": RetrievalStrategy::ALL
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>(),
        "vector_backends": [{ "key": DEFAULT_VECTOR_BACKEND, "label": "SQLite" }],
        "chunking_methods": ChunkingStrategy::ALL
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>(),
        "defaults": defaults,
    }))
}

async fn handle_rag_get_selection(State(state): State<AppState>) -> Json<serde_json::Value> {
    let selection = state.runtime.retrieval().await;
    Json(serde_json::json!({ "selection": selection }))
}

async fn handle_rag_set_selection(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let selection: RuntimeRetrieval = serde_json::from_value(
        body.get("selection")
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    )
    .map_err(|e| AppError::Unhandled(anyhow::anyhow!("invalid selection: {e}")))?;

    let updated = state.runtime.set_retrieval(selection).await?;
    Ok(Json(serde_json::json!({ "selection": updated })))
}

async fn handle_rag_reset(State(state): State<AppState>) -> Json<serde_json::Value> {
    let updated = state.runtime.reset_retrieval().await;
    Json(serde_json::json!({ "selection": updated }))
}

// ============ Stats & health ============

#[derive(Serialize)]
struct StatsResponse {
    files: i64,
    chunks: i64,
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let files = store::count_documents(&state.pool)
        .await
        .map_err(AppError::Unhandled)?;
    let chunks = store::count_passages(&state.pool)
        .await
        .map_err(AppError::Unhandled)?;
    Ok(Json(StatsResponse { files, chunks }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retrieved(doc_id: i64) -> RetrievedPassage {
        RetrievedPassage {
            passage_id: 7,
            document_id: doc_id,
            filename: "report.pdf".to_string(),
            text: "The answer is on page two.".to_string(),
            section_heading: Some("Findings".to_string()),
            page_number: Some(2),
            score: Some(0.83),
        }
    }

    #[test]
    fn context_chunk_payload_shape() {
        let chunks = to_context_chunks(&[retrieved(3)]);
        let json = serde_json::to_value(&chunks).unwrap();
        assert_eq!(json[0]["citation"]["doc_id"], "3");
        assert_eq!(json[0]["citation"]["filename"], "report.pdf");
        assert_eq!(json[0]["citation"]["page"], 2);
        assert_eq!(json[0]["citation"]["section"], "Findings");
        assert_eq!(json[0]["chunk"], "The answer is on page two.");
    }

    #[test]
    fn fragment_payload_carries_raw_and_cleaned() {
        let event = AnswerEvent::Fragment {
            raw: "abc".to_string(),
            cleaned: "abc".to_string(),
        };
        // The SSE event itself is opaque; check the payload we feed it.
        if let AnswerEvent::Fragment { raw, cleaned } = event {
            let payload = serde_json::json!({ "raw": raw, "cleaned": cleaned });
            assert_eq!(payload["raw"], payload["cleaned"]);
        }
    }
}
