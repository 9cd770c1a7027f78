//! Document-to-markdown conversion.
//!
//! Binary formats (PDF, DOCX) go through a heavyweight extraction path;
//! plain text is already valid markdown and passes through. Conversion
//! never fails the caller: any extractor error falls back to a lossy UTF-8
//! decode of the raw bytes, and a total failure yields an empty string,
//! which the ingestion pipeline reports as `NoContentExtracted`.
//!
//! PDF page breaks survive as form-feed characters in the output so the
//! chunking layer can attribute passages to pages.

use std::io::Read;
use std::path::Path;

use tracing::warn;

/// Result of converting an upload to normalized markdown.
#[derive(Debug, Clone)]
pub struct ConvertedDocument {
    pub markdown: String,
    /// True when the heavyweight extractor produced the text (as opposed to
    /// the raw-bytes fallback).
    pub used_extractor: bool,
}

/// Pluggable conversion capability consumed by the ingestion pipeline.
pub trait DocumentConverter: Send + Sync {
    fn to_markdown(&self, path: &Path, filetype: &str) -> ConvertedDocument;
}

/// Default converter: `pdf-extract` for PDFs, ZIP + XML walking for DOCX,
/// passthrough for plain text.
pub struct ExtractingConverter;

impl DocumentConverter for ExtractingConverter {
    fn to_markdown(&self, path: &Path, filetype: &str) -> ConvertedDocument {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to read {} for conversion: {}", path.display(), e);
                return ConvertedDocument {
                    markdown: String::new(),
                    used_extractor: false,
                };
            }
        };

        let extracted = match filetype {
            "pdf" => extract_pdf(&bytes),
            "docx" => extract_docx(&bytes),
            // Plain text is valid markdown as-is.
            _ => {
                return ConvertedDocument {
                    markdown: String::from_utf8_lossy(&bytes).into_owned(),
                    used_extractor: false,
                }
            }
        };

        match extracted {
            Ok(markdown) => ConvertedDocument {
                markdown,
                used_extractor: true,
            },
            Err(e) => {
                warn!(
                    "extractor failed for {} ({}): {}; falling back to raw text",
                    path.display(),
                    filetype,
                    e
                );
                ConvertedDocument {
                    markdown: String::from_utf8_lossy(&bytes).into_owned(),
                    used_extractor: false,
                }
            }
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> anyhow::Result<String> {
    let text = pdf_extract::extract_text_from_mem(bytes)?;
    Ok(text)
}

/// Pull the document body out of a DOCX archive: `word/document.xml`,
/// `<w:t>` runs joined within a paragraph, paragraphs separated by blank
/// lines.
fn extract_docx(bytes: &[u8]) -> anyhow::Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let mut doc_xml = Vec::new();
    archive
        .by_name("word/document.xml")?
        .read_to_end(&mut doc_xml)?;

    let mut out = String::new();
    let mut paragraph = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text => {
                paragraph.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let trimmed = paragraph.trim();
                    if !trimmed.is_empty() {
                        if !out.is_empty() {
                            out.push_str("\n\n");
                        }
                        out.push_str(trimmed);
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(bytes: &[u8], name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        (tmp, path)
    }

    #[test]
    fn plain_text_passes_through() {
        let (_tmp, path) = write_temp(b"# Title\n\nBody text.", "note.txt");
        let converted = ExtractingConverter.to_markdown(&path, "txt");
        assert!(!converted.used_extractor);
        assert_eq!(converted.markdown, "# Title\n\nBody text.");
    }

    #[test]
    fn invalid_pdf_falls_back_to_raw_decode() {
        let (_tmp, path) = write_temp(b"not a pdf at all", "broken.pdf");
        let converted = ExtractingConverter.to_markdown(&path, "pdf");
        assert!(!converted.used_extractor);
        assert_eq!(converted.markdown, "not a pdf at all");
    }

    #[test]
    fn invalid_docx_falls_back_to_raw_decode() {
        let (_tmp, path) = write_temp(b"zip? no", "broken.docx");
        let converted = ExtractingConverter.to_markdown(&path, "docx");
        assert!(!converted.used_extractor);
        assert_eq!(converted.markdown, "zip? no");
    }

    #[test]
    fn missing_file_yields_empty_string() {
        let converted =
            ExtractingConverter.to_markdown(Path::new("/nonexistent/ghost.txt"), "txt");
        assert!(converted.markdown.is_empty());
        assert!(!converted.used_extractor);
    }

    #[test]
    fn docx_paragraphs_become_blank_line_separated() {
        // Minimal DOCX: a zip with just word/document.xml
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("word/document.xml", options).unwrap();
            use std::io::Write;
            writer
                .write_all(
                    br#"<w:document xmlns:w="ns"><w:body>
                        <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
                        <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph.</w:t></w:r></w:p>
                    </w:body></w:document>"#,
                )
                .unwrap();
            writer.finish().unwrap();
        }
        let (_tmp, path) = write_temp(cursor.get_ref(), "doc.docx");
        let converted = ExtractingConverter.to_markdown(&path, "docx");
        assert!(converted.used_extractor);
        assert_eq!(
            converted.markdown,
            "First paragraph.\n\nSecond paragraph."
        );
    }
}
