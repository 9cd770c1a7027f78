//! Upload persistence: content-type allow-list, size cap, disk write.

use std::path::PathBuf;

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::models::Upload;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TXT: &str = "text/plain";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Map a MIME type to the short filetype key stored on the document.
pub fn filetype_for(content_type: &str) -> Option<&'static str> {
    match content_type {
        MIME_PDF => Some("pdf"),
        MIME_TXT => Some("txt"),
        MIME_DOCX => Some("docx"),
        _ => None,
    }
}

/// Guess a MIME type from a filename extension. Used by the CLI, where
/// uploads arrive as bare paths rather than typed multipart parts.
pub fn content_type_for_path(path: &std::path::Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => Some(MIME_PDF),
        Some("txt") | Some("md") | Some("text") => Some(MIME_TXT),
        Some("docx") => Some(MIME_DOCX),
        _ => None,
    }
}

/// Persist an upload to the file directory, enforcing the type allow-list
/// and the configured size cap. Returns the destination path and filetype
/// key. Nothing is written when validation fails.
pub fn save_upload(settings: &Settings, upload: &Upload) -> AppResult<(PathBuf, String)> {
    let filetype = filetype_for(&upload.content_type)
        .ok_or_else(|| AppError::UnsupportedFileType(upload.content_type.clone()))?;

    if upload.bytes.len() as u64 > settings.max_file_bytes() {
        return Err(AppError::FileTooLarge {
            limit_mb: settings.storage.max_file_mb,
        });
    }

    let dir = settings.file_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| AppError::Unhandled(anyhow::anyhow!("creating file dir: {e}")))?;

    // Keep only the final path component of the client-supplied name.
    let safe_name = std::path::Path::new(&upload.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let destination = dir.join(&safe_name);
    std::fs::write(&destination, &upload.bytes)
        .map_err(|e| AppError::Unhandled(anyhow::anyhow!("writing upload: {e}")))?;

    Ok((destination, filetype.to_string()))
}

/// Remove a stored file, ignoring the case where it is already gone.
pub fn remove_stored_file(path: &str) {
    let p = std::path::Path::new(path);
    if p.exists() {
        if let Err(e) = std::fs::remove_file(p) {
            tracing::warn!("failed to remove stored file {}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in(tmp: &tempfile::TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.storage.root = tmp.path().to_path_buf();
        settings.storage.max_file_mb = 1;
        settings
    }

    fn upload(content_type: &str, bytes: Vec<u8>) -> Upload {
        Upload {
            filename: "note.txt".to_string(),
            content_type: content_type.to_string(),
            bytes,
        }
    }

    #[test]
    fn saves_allowed_type() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = settings_in(&tmp);
        let (path, filetype) = save_upload(&settings, &upload(MIME_TXT, b"hello".to_vec())).unwrap();
        assert_eq!(filetype, "txt");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn rejects_unsupported_type() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = settings_in(&tmp);
        let err = save_upload(&settings, &upload("image/png", vec![1, 2, 3])).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FILE_TYPE");
    }

    #[test]
    fn rejects_oversized_upload() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = settings_in(&tmp);
        let big = vec![0u8; 2 * 1024 * 1024];
        let err = save_upload(&settings, &upload(MIME_TXT, big)).unwrap_err();
        assert_eq!(err.code(), "FILE_TOO_LARGE");
        // Nothing written on failure
        assert!(!settings.file_dir().join("note.txt").exists());
    }

    #[test]
    fn strips_path_components_from_filename() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = settings_in(&tmp);
        let mut up = upload(MIME_TXT, b"x".to_vec());
        up.filename = "../../etc/passwd".to_string();
        let (path, _) = save_upload(&settings, &up).unwrap();
        assert!(path.starts_with(settings.file_dir()));
        assert_eq!(path.file_name().unwrap(), "passwd");
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(
            content_type_for_path(std::path::Path::new("a/b/report.PDF")),
            Some(MIME_PDF)
        );
        assert_eq!(
            content_type_for_path(std::path::Path::new("notes.md")),
            Some(MIME_TXT)
        );
        assert_eq!(content_type_for_path(std::path::Path::new("img.png")), None);
    }
}
