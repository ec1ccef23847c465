use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;
use url::Url;

/// Matches the sentence-transformer model (`all-MiniLM-L6-v2`) the stored
/// vectors are sized for.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

pub const CHARACTER_NGRAM_MODEL_ID: &str = "char-trigram-fnv1a";

/// Maps text to a fixed-length vector. One instance is shared read-only by
/// every concurrent ingestion and query.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identity of the model; vectors from different models are not comparable.
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[async_trait]
impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed(text).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
    pub normalize: bool,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            normalize: false,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Self::default()
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        if chars.len() < 3 {
            let token = chars.iter().collect::<String>();
            let index = bucket(&token, vector.len());
            vector[index] += 1.0;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let index = bucket(&token, vector.len());
            vector[index] += 1.0;
        }

        if self.normalize {
            let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
            if magnitude > 0.0 {
                for value in &mut vector {
                    *value /= magnitude;
                }
            }
        }

        vector
    }
}

fn bucket(token: &str, buckets: usize) -> usize {
    let mut hash = 1469598103934665603u64;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % buckets as u64) as usize
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        CHARACTER_NGRAM_MODEL_ID
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `POST /embeddings` endpoint, e.g. a local
/// text-embeddings server hosting a sentence-transformer model.
pub struct HttpEmbedder {
    endpoint: Url,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, EmbeddingError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            model: model.into(),
            dimensions,
            api_key: None,
            client: Client::new(),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        debug!(model = %self.model, text_len = text.len(), "requesting embedding");

        let mut request = self.client.post(self.endpoint.clone()).json(&EmbeddingRequest {
            model: &self.model,
            input: vec![text],
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EmbeddingError::BackendResponse {
                backend: self.endpoint.to_string(),
                details: response.status().to_string(),
            });
        }

        let payload: EmbeddingResponse = response.json().await?;
        let embedding = parse_single_embedding(payload)?;
        if embedding.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }

        Ok(embedding)
    }
}

fn parse_single_embedding(payload: EmbeddingResponse) -> Result<Vec<f32>, EmbeddingError> {
    payload
        .data
        .into_iter()
        .next()
        .map(|data| data.embedding)
        .filter(|embedding| !embedding.is_empty())
        .ok_or_else(|| EmbeddingError::InvalidResponse("response carried no embedding".to_string()))
}

pub const DEFAULT_EMBEDDING_CACHE_CAPACITY: usize = 4096;

/// Memoizes another embedder by the SHA-256 digest of the input text, keeping
/// at most `capacity` vectors and evicting the least recently used.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Mutex<LruCache<[u8; 32], Vec<f32>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    fn lookup(&self, key: &[u8; 32]) -> Option<Vec<f32>> {
        self.cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(key).cloned())
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }

        let vector = self.inner.embed(text).await?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, vector.clone());
        }
        Ok(vector)
    }
}
