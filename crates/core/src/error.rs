use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf extraction error: {0}")]
    Extraction(String),

    #[error("no text could be extracted from the document")]
    EmptyDocument,

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("chunk id {chunk_id} already exists in collection {collection}")]
    DuplicateChunkId { collection: String, chunk_id: String },

    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("store was created with {key}={stored}, but {configured} is configured")]
    ConfigMismatch {
        key: String,
        stored: String,
        configured: String,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("malformed embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding provider not configured: {0}")]
    NotConfigured(String),
}

/// Failure surfaced by the retrieval engine to its callers.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RetrievalError {
    /// True for failures caused by the caller's input, which a user can fix by
    /// retrying with different arguments. Everything else is an unexpected
    /// failure of the current call.
    pub fn is_caller_error(&self) -> bool {
        match self {
            Self::Ingest(error) => matches!(
                error,
                IngestError::Extraction(_)
                    | IngestError::EmptyDocument
                    | IngestError::InvalidChunkConfig(_)
                    | IngestError::InvalidArgument(_)
            ),
            Self::Store(error) => matches!(
                error,
                StoreError::CollectionNotFound(_)
                    | StoreError::CollectionExists(_)
                    | StoreError::DuplicateChunkId { .. }
                    | StoreError::InvalidCollectionName(_)
            ),
            Self::Embedding(_) => false,
            Self::InvalidArgument(_) => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::CollectionNotFound(_)))
    }
}

pub type Result<T, E = RetrievalError> = std::result::Result<T, E>;
