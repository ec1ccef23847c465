pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod stores;
pub mod traits;

pub use chunking::{
    ChunkingConfig, Cl100kTokenizer, TextChunker, TokenCounter, DEFAULT_CHUNK_MAX_TOKENS,
    DEFAULT_CHUNK_OVERLAP_TOKENS, DEFAULT_SEPARATOR,
};
pub use config::{DynEmbedder, EmbeddingConfig, EmbeddingProvider, RetrievalConfig};
pub use embeddings::{
    CachedEmbedder, CharacterNgramEmbedder, Embedder, HttpEmbedder, CHARACTER_NGRAM_MODEL_ID,
    DEFAULT_EMBEDDING_CACHE_CAPACITY, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, IngestError, RetrievalError, StoreError};
pub use extractor::{extract_page_texts, extract_text, LopdfExtractor, PageText, PdfExtractor, PdfSource};
pub use ingest::{
    collection_name_from_path, discover_pdf_files, ingest_folder_best_effort,
    FolderIngestionReport, SkippedPdf,
};
pub use models::{Collection, DistanceMetric, IngestReport, ScoredChunk};
pub use orchestrator::{chunk_id, RetrievalEngine};
pub use stores::{validate_collection_name, SqliteCollectionStore, StoreSettings};
pub use traits::CollectionStore;
