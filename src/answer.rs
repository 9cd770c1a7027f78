//! Query orchestrator.
//!
//! Builds a grounded prompt from retrieved passages and drives streaming
//! generation. The answer is produced over a bounded channel of
//! [`AnswerEvent`]s; the channel closes only after a terminal `End` event,
//! which is emitted exactly once even when generation fails mid-stream.
//!
//! When retrieval finds nothing, the stream yields one fixed fallback
//! fragment and ends without ever contacting the generation provider.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::embedding::Embedder;
use crate::error::{AppError, AppResult, ErrorBody};
use crate::generation::{build_prompt, Generator};
use crate::models::RetrievedPassage;
use crate::retrieval;
use crate::runtime::RuntimeRetrieval;
use crate::vector::VectorIndex;

/// The sentence returned when no passage matches the question.
pub const FALLBACK_ANSWER: &str = "I don't know based on the provided documents.";

/// One event in the answer stream.
#[derive(Debug, Clone)]
pub enum AnswerEvent {
    /// An incremental generated fragment. `raw` and `cleaned` are currently
    /// identical; the pair is part of the wire contract.
    Fragment { raw: String, cleaned: String },
    /// A failure after streaming started. Followed by `End`, never by more
    /// fragments.
    Error(ErrorBody),
    /// Terminal event, emitted exactly once.
    End,
}

/// Retrieve passages for `query_text` and stream a grounded answer.
///
/// Returns the event stream together with the retrieved passages so the
/// transport layer can emit its context preamble before the first fragment.
#[allow(clippy::too_many_arguments)]
pub async fn run_query(
    pool: &SqlitePool,
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    generator: Arc<dyn Generator>,
    rag: &RuntimeRetrieval,
    query_text: &str,
    k: usize,
    document_ids: Option<&[i64]>,
) -> AppResult<(mpsc::Receiver<AnswerEvent>, Vec<RetrievedPassage>)> {
    let retrieved =
        retrieval::retrieve(pool, index, embedder, rag, query_text, k, document_ids).await?;

    info!(
        "query retrieved {} passages (strategy={})",
        retrieved.len(),
        rag.retrieval_strategy
    );

    let rx = stream_answer(generator, query_text.to_string(), &retrieved);
    Ok((rx, retrieved))
}

/// Start the answer producer for an already-retrieved context set.
///
/// The producer observes consumer disconnects through channel send
/// failures and stops issuing upstream calls as soon as one occurs.
pub fn stream_answer(
    generator: Arc<dyn Generator>,
    query_text: String,
    retrieved: &[RetrievedPassage],
) -> mpsc::Receiver<AnswerEvent> {
    let (tx, rx) = mpsc::channel(32);
    let contexts = context_texts(retrieved);

    tokio::spawn(async move {
        if contexts.is_empty() {
            let _ = tx
                .send(AnswerEvent::Fragment {
                    raw: FALLBACK_ANSWER.to_string(),
                    cleaned: FALLBACK_ANSWER.to_string(),
                })
                .await;
            let _ = tx.send(AnswerEvent::End).await;
            return;
        }

        let prompt = build_prompt(&query_text, &contexts);

        match generator.stream(&prompt).await {
            Ok(mut fragments) => {
                while let Some(item) = fragments.recv().await {
                    match item {
                        Ok(text) => {
                            let event = AnswerEvent::Fragment {
                                raw: text.clone(),
                                cleaned: text,
                            };
                            if tx.send(event).await.is_err() {
                                // Consumer disconnected; dropping the
                                // fragment receiver cancels generation.
                                return;
                            }
                        }
                        Err(e) => {
                            send_error(&tx, e).await;
                            break;
                        }
                    }
                }
            }
            Err(e) => send_error(&tx, e).await,
        }

        let _ = tx.send(AnswerEvent::End).await;
    });

    rx
}

async fn send_error(tx: &mpsc::Sender<AnswerEvent>, err: AppError) {
    let body = err.to_body();
    error!(
        "answer stream failed [{}] {}: {}",
        body.correlation_id, body.code, err
    );
    let _ = tx.send(AnswerEvent::Error(body)).await;
}

/// Format retrieved passages as tagged context blocks. Tags are included
/// only when the corresponding field is present.
pub fn context_texts(retrieved: &[RetrievedPassage]) -> Vec<String> {
    retrieved
        .iter()
        .map(|hit| {
            let mut tags = vec![format!("doc_id={}", hit.document_id)];
            if let Some(page) = hit.page_number {
                tags.push(format!("page={}", page));
            }
            if let Some(section) = hit
                .section_heading
                .as_deref()
                .filter(|s| !s.is_empty())
            {
                tags.push(format!("section=\"{}\"", section));
            }
            format!("[{}]\n{}", tags.join(", "), hit.text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn passage(doc_id: i64, text: &str, page: Option<i64>, section: Option<&str>) -> RetrievedPassage {
        RetrievedPassage {
            passage_id: 1,
            document_id: doc_id,
            filename: "doc.txt".to_string(),
            text: text.to_string(),
            section_heading: section.map(str::to_string),
            page_number: page,
            score: Some(0.9),
        }
    }

    struct MockGenerator {
        called: Arc<AtomicBool>,
        fragments: Vec<AppResult<String>>,
    }

    #[async_trait]
    impl Generator for MockGenerator {
        async fn stream(&self, _prompt: &str) -> AppResult<mpsc::Receiver<AppResult<String>>> {
            self.called.store(true, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(8);
            for item in self.fragments.iter() {
                let item = match item {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(AppError::GenerationFailed(e.to_string())),
                };
                tx.send(item).await.unwrap();
            }
            Ok(rx)
        }
    }

    #[test]
    fn context_tags_include_only_present_fields() {
        let texts = context_texts(&[
            passage(3, "plain", None, None),
            passage(4, "paged", Some(2), None),
            passage(5, "full", Some(7), Some("Results")),
        ]);
        assert_eq!(texts[0], "[doc_id=3]\nplain");
        assert_eq!(texts[1], "[doc_id=4, page=2]\npaged");
        assert_eq!(texts[2], "[doc_id=5, page=7, section=\"Results\"]\nfull");
    }

    #[tokio::test]
    async fn empty_retrieval_yields_fallback_without_generation() {
        let called = Arc::new(AtomicBool::new(false));
        let generator = Arc::new(MockGenerator {
            called: called.clone(),
            fragments: vec![],
        });

        let mut rx = stream_answer(generator, "anything?".to_string(), &[]);

        match rx.recv().await.unwrap() {
            AnswerEvent::Fragment { raw, cleaned } => {
                assert_eq!(raw, FALLBACK_ANSWER);
                assert_eq!(cleaned, FALLBACK_ANSWER);
            }
            other => panic!("expected fragment, got {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), AnswerEvent::End));
        assert!(rx.recv().await.is_none());
        assert!(!called.load(Ordering::SeqCst), "generator must not be called");
    }

    #[tokio::test]
    async fn fragments_flow_through_and_stream_ends_once() {
        let generator = Arc::new(MockGenerator {
            called: Arc::new(AtomicBool::new(false)),
            fragments: vec![Ok("Hello ".to_string()), Ok("world.".to_string())],
        });

        let retrieved = vec![passage(1, "context text", None, None)];
        let mut rx = stream_answer(generator, "q".to_string(), &retrieved);

        let mut fragments = Vec::new();
        let mut ends = 0;
        while let Some(event) = rx.recv().await {
            match event {
                AnswerEvent::Fragment { raw, .. } => fragments.push(raw),
                AnswerEvent::End => ends += 1,
                AnswerEvent::Error(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(fragments, vec!["Hello ", "world."]);
        assert_eq!(ends, 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_error_then_end() {
        let generator = Arc::new(MockGenerator {
            called: Arc::new(AtomicBool::new(false)),
            fragments: vec![
                Ok("partial".to_string()),
                Err(AppError::GenerationFailed("connection reset".to_string())),
            ],
        });

        let retrieved = vec![passage(1, "context", None, None)];
        let mut rx = stream_answer(generator, "q".to_string(), &retrieved);

        let events: Vec<AnswerEvent> = {
            let mut out = Vec::new();
            while let Some(e) = rx.recv().await {
                out.push(e);
            }
            out
        };

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], AnswerEvent::Fragment { .. }));
        match &events[1] {
            AnswerEvent::Error(body) => {
                assert_eq!(body.code, "GENERATION_FAILED");
                assert!(!body.correlation_id.is_empty());
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(matches!(events[2], AnswerEvent::End));
    }
}
