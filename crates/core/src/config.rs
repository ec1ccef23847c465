use crate::chunking::{ChunkingConfig, TextChunker};
use crate::embeddings::{
    CachedEmbedder, CharacterNgramEmbedder, Embedder, HttpEmbedder,
    DEFAULT_EMBEDDING_CACHE_CAPACITY, DEFAULT_EMBEDDING_DIMENSIONS,
};
use crate::orchestrator::RetrievalEngine;
use crate::stores::{SqliteCollectionStore, StoreSettings};
use crate::{DistanceMetric, EmbeddingError, RetrievalError};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;

pub const DEFAULT_STORE_PATH: &str = "./retrieval_db/store.sqlite3";
pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_HTTP_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    #[default]
    Local,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimensions: usize,
    pub normalize: bool,
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Most recent embeddings kept in memory; 0 disables the cache.
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Local,
            model: DEFAULT_HTTP_MODEL.to_string(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            normalize: false,
            endpoint: None,
            api_key: None,
            cache_capacity: DEFAULT_EMBEDDING_CACHE_CAPACITY,
        }
    }
}

pub type DynEmbedder = Box<dyn Embedder>;

impl EmbeddingConfig {
    pub fn build(&self) -> Result<DynEmbedder, EmbeddingError> {
        let embedder: DynEmbedder = match self.provider {
            EmbeddingProvider::Local => Box::new(CharacterNgramEmbedder {
                dimensions: self.dimensions,
                normalize: self.normalize,
            }),
            EmbeddingProvider::Http => {
                let endpoint = self.endpoint.as_deref().ok_or_else(|| {
                    EmbeddingError::NotConfigured(
                        "the http embedding provider needs an endpoint".to_string(),
                    )
                })?;
                Box::new(
                    HttpEmbedder::new(endpoint, self.model.clone(), self.dimensions)?
                        .with_api_key(self.api_key.clone()),
                )
            }
        };

        match NonZeroUsize::new(self.cache_capacity) {
            Some(capacity) => Ok(Box::new(CachedEmbedder::new(embedder, capacity))),
            None => Ok(embedder),
        }
    }
}

/// Process-wide settings, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub store_path: PathBuf,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub metric: DistanceMetric,
    pub default_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            metric: DistanceMetric::default(),
            default_top_k: DEFAULT_TOP_K,
        }
    }
}

impl RetrievalConfig {
    /// Opens the store and wires up the engine with the configured components.
    pub fn open_engine(
        &self,
    ) -> Result<RetrievalEngine<SqliteCollectionStore, DynEmbedder>, RetrievalError> {
        let embedder = self.embedding.build()?;
        let chunker = TextChunker::cl100k(self.chunking.clone())?;
        let store = SqliteCollectionStore::open(
            &self.store_path,
            StoreSettings {
                dimensions: embedder.dimensions(),
                metric: self.metric,
                embedding_model: embedder.model_id().to_string(),
            },
        )?;
        RetrievalEngine::new(store, embedder, chunker)
    }
}
