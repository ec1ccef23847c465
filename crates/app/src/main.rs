use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pdf_retrieval_core::{
    ingest_folder_best_effort, ChunkingConfig, CollectionStore, DistanceMetric, DynEmbedder,
    EmbeddingConfig, EmbeddingProvider, RetrievalConfig, RetrievalEngine, RetrievalError,
    SqliteCollectionStore, DEFAULT_CHUNK_MAX_TOKENS, DEFAULT_CHUNK_OVERLAP_TOKENS,
    DEFAULT_EMBEDDING_CACHE_CAPACITY, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_SEPARATOR,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Engine = RetrievalEngine<SqliteCollectionStore, DynEmbedder>;

#[derive(Parser)]
#[command(name = "pdf-retrieval", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Args)]
struct Settings {
    /// SQLite file holding every collection
    #[arg(long, env = "PDF_RETRIEVAL_STORE", default_value = pdf_retrieval_core::config::DEFAULT_STORE_PATH, global = true)]
    store: PathBuf,

    /// Maximum chunk size in cl100k tokens
    #[arg(long, env = "PDF_RETRIEVAL_CHUNK_TOKENS", default_value_t = DEFAULT_CHUNK_MAX_TOKENS, global = true)]
    chunk_tokens: usize,

    /// Tokens shared by consecutive chunks
    #[arg(long, env = "PDF_RETRIEVAL_CHUNK_OVERLAP", default_value_t = DEFAULT_CHUNK_OVERLAP_TOKENS, global = true)]
    chunk_overlap: usize,

    /// Preferred split point
    #[arg(long, env = "PDF_RETRIEVAL_SEPARATOR", default_value = DEFAULT_SEPARATOR, global = true)]
    separator: String,

    /// Embedding backend
    #[arg(long, env = "PDF_RETRIEVAL_EMBEDDER", value_enum, default_value_t = EmbeddingProvider::Local, global = true)]
    embedder: EmbeddingProvider,

    /// OpenAI-compatible embeddings URL for the http backend
    #[arg(long, env = "PDF_RETRIEVAL_EMBEDDING_URL", global = true)]
    embedding_url: Option<String>,

    /// Embedding model name for the http backend
    #[arg(long, env = "PDF_RETRIEVAL_EMBEDDING_MODEL", default_value = pdf_retrieval_core::config::DEFAULT_HTTP_MODEL, global = true)]
    embedding_model: String,

    /// Bearer token for the http backend
    #[arg(long, env = "PDF_RETRIEVAL_EMBEDDING_API_KEY", hide_env_values = true, global = true)]
    embedding_api_key: Option<String>,

    /// Embedding dimension
    #[arg(long, env = "PDF_RETRIEVAL_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS, global = true)]
    dimensions: usize,

    /// Embeddings kept in the in-memory cache; 0 turns it off
    #[arg(long, env = "PDF_RETRIEVAL_EMBEDDING_CACHE", default_value_t = DEFAULT_EMBEDDING_CACHE_CAPACITY, global = true)]
    embedding_cache: usize,

    /// Similarity metric
    #[arg(long, env = "PDF_RETRIEVAL_METRIC", value_enum, default_value_t = DistanceMetric::Cosine, global = true)]
    metric: DistanceMetric,
}

impl Settings {
    fn into_config(self) -> RetrievalConfig {
        RetrievalConfig {
            store_path: self.store,
            chunking: ChunkingConfig {
                max_tokens: self.chunk_tokens,
                overlap_tokens: self.chunk_overlap,
                separator: self.separator,
            },
            embedding: EmbeddingConfig {
                provider: self.embedder,
                model: self.embedding_model,
                dimensions: self.dimensions,
                endpoint: self.embedding_url,
                api_key: self.embedding_api_key,
                cache_capacity: self.embedding_cache,
                ..EmbeddingConfig::default()
            },
            metric: self.metric,
            ..RetrievalConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one PDF or every PDF under a folder.
    Ingest {
        /// PDF file to ingest.
        #[arg(long, conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        /// Folder searched recursively for PDFs.
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Target collection; defaults to the file name.
        #[arg(long)]
        collection: Option<String>,
    },
    /// Retrieve the passages most relevant to a question.
    Query {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        question: String,
        /// Number of passages to return.
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the prompt a completion model would receive.
        #[arg(long, default_value_t = false)]
        show_prompt: bool,
    },
    /// List collection names.
    List,
    /// Create an empty collection.
    Create {
        #[arg(long)]
        collection: String,
    },
    /// Show a collection's size and creation time.
    Stats {
        #[arg(long)]
        collection: String,
    },
    /// Delete one collection and all of its chunks.
    Delete {
        #[arg(long)]
        collection: String,
    },
    /// Delete every collection in the store.
    DeleteAll {
        /// Required confirmation.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.settings.into_config();
    let default_top_k = config.default_top_k;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        store = %config.store_path.display(),
        "pdf-retrieval boot"
    );

    let engine = match config
        .open_engine()
        .with_context(|| format!("opening store {}", config.store_path.display()))
    {
        Ok(engine) => engine,
        Err(error) => return report_failure(&error),
    };

    let outcome = run(&engine, cli.command, default_top_k).await;

    if let Err(error) = engine.into_store().close() {
        warn!(%error, "store did not close cleanly");
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => report_failure(&error),
    }
}

async fn run(engine: &Engine, command: Command, default_top_k: usize) -> anyhow::Result<()> {
    match command {
        Command::Ingest {
            file,
            folder,
            collection,
        } => {
            if let Some(folder) = folder {
                let report = ingest_folder_best_effort(engine, &folder, collection.as_deref())
                    .await
                    .with_context(|| format!("ingesting folder {}", folder.display()))?;
                for skipped in &report.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
                }
                for ingested in &report.ingested {
                    println!(
                        "{} chunks ingested into {}",
                        ingested.chunk_count, ingested.collection
                    );
                }
                println!(
                    "{} chunks from {} file(s), {} skipped",
                    report.chunk_count(),
                    report.ingested.len(),
                    report.skipped_files.len()
                );
            } else if let Some(file) = file {
                let report = engine
                    .ingest_path(&file, collection.as_deref())
                    .await
                    .with_context(|| format!("ingesting {}", file.display()))?;
                println!(
                    "PDF ingested successfully with {} chunks into {} at {}",
                    report.chunk_count,
                    report.collection,
                    report.finished_at.to_rfc3339()
                );
            }
        }
        Command::Query {
            collection,
            question,
            top_k,
            show_prompt,
        } => {
            let hits = engine
                .retrieve_scored(&question, &collection, top_k.unwrap_or(default_top_k))
                .await?;

            println!("question: {question}");
            if hits.is_empty() {
                println!("no passages found in {collection}");
            }
            for hit in &hits {
                println!("[{}] score={:.4}", hit.chunk_id, hit.score);
                println!("{}", hit.text);
            }

            if show_prompt {
                let context = hits.first().map(|hit| hit.text.as_str()).unwrap_or_default();
                println!("--- prompt ---");
                println!(
                    "Use the following document info to answer the question:\n\n{context}\n\nQuestion: {question}\nAnswer:"
                );
            }
        }
        Command::List => {
            for name in engine.store().list().await.map_err(RetrievalError::from)? {
                println!("{name}");
            }
        }
        Command::Create { collection } => {
            let created = engine
                .store()
                .create(&collection)
                .await
                .map_err(RetrievalError::from)?;
            println!("created {} at {}", created.name, created.created_at.to_rfc3339());
        }
        Command::Stats { collection } => {
            let stats = engine
                .store()
                .get(&collection)
                .await
                .map_err(RetrievalError::from)?;
            println!(
                "{}: {} chunks, created {}",
                stats.name,
                stats.chunk_count,
                stats.created_at.to_rfc3339()
            );
        }
        Command::Delete { collection } => {
            if engine.delete_collection(&collection).await? {
                println!("deleted {collection}");
            } else {
                println!("{collection} did not exist");
            }
        }
        Command::DeleteAll { yes } => {
            if !yes {
                return Err(RetrievalError::InvalidArgument(
                    "delete-all removes every collection; pass --yes to confirm".to_string(),
                )
                .into());
            }
            let removed = engine
                .store()
                .delete_all()
                .await
                .map_err(RetrievalError::from)?;
            println!("deleted {} collection(s): {}", removed.len(), removed.join(", "));
        }
    }

    Ok(())
}

/// Exit status 2 for problems with the caller's input, 1 for everything else.
fn report_failure(error: &anyhow::Error) -> ExitCode {
    eprintln!("error: {error:#}");
    let caller_error = error
        .downcast_ref::<RetrievalError>()
        .is_some_and(RetrievalError::is_caller_error);
    if caller_error {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}
