//! # DocQuery CLI (`dq`)
//!
//! The `dq` binary is the primary interface for DocQuery. It provides
//! commands for database initialization, document ingestion, question
//! answering, provider inspection, runtime configuration, and starting the
//! HTTP API server.
//!
//! ## Usage
//!
//! ```bash
//! dq --config ./dq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dq init` | Create the SQLite database and run schema migrations |
//! | `dq ingest <path>` | Ingest a document into the knowledge base |
//! | `dq reingest <id> <path>` | Replace a document's upload and re-index it |
//! | `dq remove <id>` | Delete a document and all derived data |
//! | `dq files` | List ingested documents |
//! | `dq chunks <id>` | List a document's passages |
//! | `dq ask "<question>"` | Ask a question; the answer streams to stdout |
//! | `dq providers <kind>` | List available llm/embedding providers |
//! | `dq models <provider>` | Live model listing for a provider |
//! | `dq config <action>` | Show or change the runtime configuration |
//! | `dq stats` | Document and passage counts |
//! | `dq serve` | Start the HTTP API server |

mod answer;
mod chunking;
mod config;
mod convert;
mod db;
mod embedding;
mod error;
mod generation;
mod ingest;
mod migrate;
mod models;
mod providers;
mod retrieval;
mod runtime;
mod server;
mod storage;
mod store;
mod vector;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::answer::AnswerEvent;
use crate::chunking::ChunkingStrategy;
use crate::convert::ExtractingConverter;
use crate::error::AppError;
use crate::models::{ProviderKind, Upload};
use crate::runtime::{RuntimeModels, RuntimeRetrieval, RuntimeStore};
use crate::server::AppState;

/// DocQuery — a local-first document knowledge base with
/// retrieval-augmented question answering.
#[derive(Parser)]
#[command(
    name = "dq",
    about = "DocQuery — a local-first document knowledge base with retrieval-augmented question answering",
    version,
    long_about = "DocQuery ingests PDF, DOCX, and plain-text documents, chunks and embeds them \
    into a local vector index, and answers natural-language questions grounded in the retrieved \
    passages, streaming the answer as it is generated."
)]
struct Cli {
    /// Path to configuration file (TOML). Missing file = built-in defaults.
    #[arg(long, global = true, default_value = "./dq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Ingest a document into the knowledge base.
    Ingest {
        /// Path to the document (pdf, docx, txt, md).
        path: PathBuf,

        /// Chunking strategy (recursive_character, character, token,
        /// markdown_header, sentence, sentence_window). Defaults to the
        /// runtime configuration.
        #[arg(long)]
        chunking: Option<String>,
    },

    /// Replace a document's upload and rebuild its passages and vectors.
    Reingest {
        /// Document id.
        id: i64,
        /// Path to the replacement document.
        path: PathBuf,
        /// Chunking strategy override.
        #[arg(long)]
        chunking: Option<String>,
    },

    /// Delete a document and all of its passages and vectors.
    Remove {
        /// Document id.
        id: i64,
    },

    /// List ingested documents.
    Files,

    /// List a document's passages in order.
    Chunks {
        /// Document id.
        id: i64,
    },

    /// Ask a question. The answer streams to stdout as it is generated.
    Ask {
        /// The question.
        question: String,

        /// Number of passages to retrieve (defaults to the runtime config).
        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict retrieval to these document ids (repeatable).
        #[arg(long = "file")]
        files: Vec<i64>,
    },

    /// List available providers for a kind (`llm` or `embedding`).
    Providers {
        /// Provider kind: llm or embedding.
        kind: String,
    },

    /// Live model listing for a provider.
    Models {
        /// Provider key (e.g. `ollama`, `openai`).
        provider: String,
    },

    /// Show or change the runtime configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Document and passage counts.
    Stats,

    /// Start the HTTP API server.
    Serve,
}

/// Runtime configuration subcommands.
#[derive(Subcommand)]
enum ConfigAction {
    /// Print the active model and retrieval configuration.
    Show,

    /// Select the generation and embedding models. Validated against the
    /// providers' live model listings; nothing is written on failure.
    SetModels {
        #[arg(long)]
        chat_provider: String,
        #[arg(long)]
        chat_model: String,
        #[arg(long)]
        embedding_provider: String,
        #[arg(long)]
        embedding_model: String,
    },

    /// Change the retrieval configuration.
    SetRetrieval {
        /// similarity, similarity_score_threshold, or mmr.
        #[arg(long)]
        strategy: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        score_threshold: Option<f64>,
        #[arg(long)]
        fetch_k: Option<usize>,
        #[arg(long)]
        lambda_mult: Option<f64>,
        #[arg(long)]
        chunking_method: Option<String>,
    },

    /// Restore the retrieval defaults (model selection is untouched).
    ResetRetrieval,
}

async fn build_state(settings: config::Settings) -> anyhow::Result<AppState> {
    let settings = Arc::new(settings);
    let pool = db::connect(&settings).await?;
    migrate::run_migrations(&pool).await?;
    let runtime = Arc::new(RuntimeStore::new(settings.clone()));

    Ok(AppState {
        settings,
        pool,
        runtime,
        converter: Arc::new(ExtractingConverter),
    })
}

fn read_upload(path: &PathBuf) -> Result<Upload, AppError> {
    let content_type = storage::content_type_for_path(path).ok_or_else(|| {
        AppError::UnsupportedFileType(
            path.extension()
                .and_then(|e| e.to_str())
                .unwrap_or("(none)")
                .to_string(),
        )
    })?;

    let bytes = std::fs::read(path)
        .map_err(|e| AppError::Unhandled(anyhow::anyhow!("reading {}: {e}", path.display())))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    Ok(Upload {
        filename,
        content_type: content_type.to_string(),
        bytes,
    })
}

async fn resolve_chunking(
    runtime: &RuntimeStore,
    requested: Option<String>,
) -> ChunkingStrategy {
    let name = match requested {
        Some(name) => Some(name),
        None => runtime.retrieval().await.chunking_method,
    };
    name.as_deref()
        .and_then(ChunkingStrategy::parse)
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = config::load_settings(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let state = build_state(settings).await?;
            state.pool.close().await;
            println!("Database initialized successfully.");
        }

        Commands::Ingest { path, chunking } => {
            let state = build_state(settings).await?;
            let upload = read_upload(&path)?;
            let method = resolve_chunking(&state.runtime, chunking).await;
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

            println!("ingested {} (id {})", file.filename, file.id);
            println!("  filetype: {}", file.filetype);
            println!("  converter: {}", if file.converted_with_extractor { "extractor" } else { "raw text" });
            println!("  passages: {}", chunks);
        }

        Commands::Reingest { id, path, chunking } => {
            let state = build_state(settings).await?;
            let upload = read_upload(&path)?;
            let method = resolve_chunking(&state.runtime, chunking).await;
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

            println!("reingested {} (id {})", file.filename, file.id);
            println!("  passages: {}", chunks);
        }

        Commands::Remove { id } => {
            let state = build_state(settings).await?;
            let index = state.runtime.vector_index(&state.pool).await;
            ingest::remove(&state.pool, index.as_ref(), id).await?;
            println!("removed document {}", id);
        }

        Commands::Files => {
            let state = build_state(settings).await?;
            let files = store::list_documents(&state.pool).await?;
            if files.is_empty() {
                println!("No documents.");
            }
            for file in files {
                println!(
                    "{}. {} ({}, {} bytes, {})",
                    file.id,
                    file.filename,
                    file.filetype,
                    file.size_bytes,
                    file.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        Commands::Chunks { id } => {
            let state = build_state(settings).await?;
            let passages = store::list_passages(&state.pool, id).await?;
            if passages.is_empty() {
                println!("No passages.");
            }
            for passage in passages {
                let mut meta = Vec::new();
                if let Some(page) = passage.page_number {
                    meta.push(format!("page {}", page));
                }
                if let Some(ref section) = passage.section_heading {
                    meta.push(format!("section \"{}\"", section));
                }
                let suffix = if meta.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", meta.join(", "))
                };
                println!("--- passage {}{}", passage.passage_index, suffix);
                println!("{}", passage.content);
            }
        }

        Commands::Ask {
            question,
            top_k,
            files,
        } => {
            let state = build_state(settings).await?;
            let rag = state.runtime.retrieval().await;
            let k = top_k.unwrap_or(rag.top_k);
            let embedder = state.runtime.embedder().await?;
            let generator = state.runtime.generator().await?;
            let index = state.runtime.vector_index(&state.pool).await;
            let filter = if files.is_empty() { None } else { Some(files.as_slice()) };

            let (mut rx, retrieved) = answer::run_query(
                &state.pool,
                index.as_ref(),
                embedder.as_ref(),
                generator,
                &rag,
                &question,
                k,
                filter,
            )
            .await?;

            for hit in &retrieved {
                let score = hit
                    .score
                    .map(|s| format!("{:.3}", s))
                    .unwrap_or_else(|| "-".to_string());
                let page = hit
                    .page_number
                    .map(|p| format!(" p.{}", p))
                    .unwrap_or_default();
                eprintln!("[{}] {}{} (doc {})", score, hit.filename, page, hit.document_id);
            }

            use std::io::Write;
            while let Some(event) = rx.recv().await {
                match event {
                    AnswerEvent::Fragment { cleaned, .. } => {
                        print!("{}", cleaned);
                        std::io::stdout().flush().ok();
                    }
                    AnswerEvent::Error(body) => {
                        eprintln!();
                        eprintln!(
                            "error [{}] {}: {}",
                            body.correlation_id, body.code, body.message
                        );
                    }
                    AnswerEvent::End => {
                        println!();
                    }
                }
            }
        }

        Commands::Providers { kind } => {
            let kind = match kind.as_str() {
                "llm" => ProviderKind::Llm,
                "embedding" => ProviderKind::Embedding,
                other => anyhow::bail!("unknown provider kind: {} (use llm or embedding)", other),
            };
            let list = providers::available_providers(&settings, kind).await;
            if list.is_empty() {
                println!("No providers available.");
            }
            for p in list {
                println!("{} — {}", p.key, p.label);
            }
        }

        Commands::Models { provider } => {
            let models = providers::list_models_for_provider(&settings, &provider).await?;
            if models.is_empty() {
                println!("No models available for {}.", provider);
            }
            for m in models {
                match m.context_length {
                    Some(ctx) => println!("{} (context {})", m.id, ctx),
                    None => println!("{}", m.id),
                }
            }
        }

        Commands::Config { action } => {
            let state = build_state(settings).await?;
            match action {
                ConfigAction::Show => {
                    let models = state.runtime.models().await;
                    let rag = state.runtime.retrieval().await;
                    println!("chat: {}/{}", models.chat_provider, models.chat_model);
                    println!(
                        "embedding: {}/{}",
                        models.embedding_provider, models.embedding_model
                    );
                    println!("retrieval: {}", serde_json::to_string_pretty(&rag)?);
                }
                ConfigAction::SetModels {
                    chat_provider,
                    chat_model,
                    embedding_provider,
                    embedding_model,
                } => {
                    let updated = state
                        .runtime
                        .set_models(RuntimeModels {
                            chat_provider,
                            chat_model,
                            embedding_provider,
                            embedding_model,
                        })
                        .await?;
                    println!(
                        "models updated: chat={}/{} embedding={}/{}",
                        updated.chat_provider,
                        updated.chat_model,
                        updated.embedding_provider,
                        updated.embedding_model
                    );
                }
                ConfigAction::SetRetrieval {
                    strategy,
                    top_k,
                    score_threshold,
                    fetch_k,
                    lambda_mult,
                    chunking_method,
                } => {
                    let current = state.runtime.retrieval().await;
                    let updated = state
                        .runtime
                        .set_retrieval(RuntimeRetrieval {
                            retrieval_strategy: strategy,
                            top_k: top_k.unwrap_or(current.top_k),
                            score_threshold: score_threshold.or(current.score_threshold),
                            fetch_k: fetch_k.or(current.fetch_k),
                            lambda_mult: lambda_mult.or(current.lambda_mult),
                            chunking_method: chunking_method.or(current.chunking_method),
                            vector_backend: current.vector_backend,
                        })
                        .await?;
                    println!("retrieval updated: {}", serde_json::to_string(&updated)?);
                }
                ConfigAction::ResetRetrieval => {
                    let updated = state.runtime.reset_retrieval().await;
                    println!("retrieval reset: {}", serde_json::to_string(&updated)?);
                }
            }
        }

        Commands::Stats => {
            let state = build_state(settings).await?;
            let files = store::count_documents(&state.pool).await?;
            let chunks = store::count_passages(&state.pool).await?;
            println!("files: {}", files);
            println!("chunks: {}", chunks);
        }

        Commands::Serve => {
            let state = build_state(settings).await?;
            server::run_server(state).await?;
        }
    }

    Ok(())
}
