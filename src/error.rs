//! Error taxonomy for externally visible failures.
//!
//! Every failure that crosses the API boundary carries a machine-readable
//! code, a human message, an optional hint, and a freshly generated
//! correlation id that also appears in the server-side log line. Unhandled
//! errors never leak their cause text to the caller; the full chain is
//! logged and only a generic message is returned.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("file exceeds {limit_mb}MB limit")]
    FileTooLarge { limit_mb: u64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid selection: {field}: {message}")]
    InvalidSelection { field: &'static str, message: String },

    #[error("unsupported retrieval strategy '{0}'")]
    UnsupportedStrategy(String),

    #[error("provider '{0}' not found")]
    ProviderNotFound(String),

    #[error("no content extracted from file")]
    NoContentExtracted,

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            AppError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidSelection { .. } => "INVALID_SELECTION",
            AppError::UnsupportedStrategy(_) => "UNSUPPORTED_STRATEGY",
            AppError::ProviderNotFound(_) => "PROVIDER_NOT_FOUND",
            AppError::NoContentExtracted => "NO_CONTENT_EXTRACTED",
            AppError::EmbeddingFailed(_) => "EMBEDDING_FAILED",
            AppError::GenerationFailed(_) => "GENERATION_FAILED",
            AppError::Unhandled(_) => "UNHANDLED_ERROR",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            AppError::UnsupportedFileType(_) => Some("Upload a PDF, DOCX, or plain-text file."),
            AppError::FileTooLarge { .. } => Some("Split the document or raise storage.max_file_mb."),
            AppError::EmbeddingFailed(_) => {
                Some("Verify the embedding model is reachable and retry.")
            }
            AppError::GenerationFailed(_) => Some("Verify the model is reachable and retry."),
            AppError::NoContentExtracted => {
                Some("The file produced no text; check that it is not empty or image-only.")
            }
            _ => None,
        }
    }

    /// Render this error for the wire, minting a correlation id. Unhandled
    /// errors are reduced to a generic message; the caller is expected to
    /// log the full error against the returned id.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            AppError::Unhandled(_) => "An internal error occurred.".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code().to_string(),
            message,
            hint: self.hint().map(str::to_string),
            correlation_id: new_correlation_id(),
        }
    }
}

/// Wire shape of an externally visible failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub correlation_id: String,
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub type AppResult<T> = Result<T, AppError>;
