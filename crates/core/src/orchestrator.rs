use crate::chunking::{Cl100kTokenizer, TextChunker, TokenCounter};
use crate::embeddings::Embedder;
use crate::extractor::{extract_text, LopdfExtractor, PdfSource};
use crate::ingest::collection_name_from_path;
use crate::stores::validate_collection_name;
use crate::traits::CollectionStore;
use crate::{
    Collection, IngestError, IngestReport, RetrievalError, ScoredChunk, StoreError,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub fn chunk_id(collection: &str, ordinal: u64) -> String {
    format!("{collection}_chunk_{ordinal}")
}

/// Runs the ingestion path (extract, chunk, embed, store) and the query path
/// (embed, nearest neighbours) over explicitly supplied components.
///
/// At most one ingestion runs per collection at a time. Chunks are stored
/// one by one in source order and a failure part-way leaves the chunks
/// already stored in place; recover by deleting the collection and ingesting
/// again.
pub struct RetrievalEngine<S, E, T = Cl100kTokenizer> {
    store: S,
    embedder: E,
    chunker: TextChunker<T>,
    extractor: LopdfExtractor,
    ingest_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S, E, T> RetrievalEngine<S, E, T>
where
    S: CollectionStore,
    E: Embedder,
    T: TokenCounter,
{
    pub fn new(store: S, embedder: E, chunker: TextChunker<T>) -> Result<Self, RetrievalError> {
        if embedder.dimensions() != store.dimensions() {
            return Err(StoreError::DimensionMismatch {
                expected: store.dimensions(),
                actual: embedder.dimensions(),
            }
            .into());
        }
        if embedder.model_id() != store.embedding_model() {
            return Err(StoreError::ConfigMismatch {
                key: "embedding_model".to_string(),
                stored: store.embedding_model().to_string(),
                configured: embedder.model_id().to_string(),
            }
            .into());
        }

        Ok(Self {
            store,
            embedder,
            chunker,
            extractor: LopdfExtractor,
            ingest_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn chunker(&self) -> &TextChunker<T> {
        &self.chunker
    }

    /// Ends the engine's lifetime and hands the store back for closing.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Returns the number of chunks stored.
    pub async fn ingest(
        &self,
        source: impl Into<PdfSource>,
        collection: &str,
    ) -> Result<usize, RetrievalError> {
        Ok(self.ingest_report(source.into(), collection).await?.chunk_count)
    }

    pub async fn ingest_report(
        &self,
        source: PdfSource,
        collection: &str,
    ) -> Result<IngestReport, RetrievalError> {
        validate_collection_name(collection)?;
        let text = extract_text(&self.extractor, &source)?;
        self.ingest_text(&text, collection).await
    }

    /// Ingests a file, naming the collection after the file when no name is given.
    pub async fn ingest_path(
        &self,
        path: &Path,
        collection: Option<&str>,
    ) -> Result<IngestReport, RetrievalError> {
        let name = match collection {
            Some(name) => name.to_string(),
            None => collection_name_from_path(path)?,
        };
        self.ingest_report(PdfSource::from(path), &name).await
    }

    /// Ingests already extracted text. Nothing is created or stored when the
    /// text has no content.
    pub async fn ingest_text(
        &self,
        text: &str,
        collection: &str,
    ) -> Result<IngestReport, RetrievalError> {
        validate_collection_name(collection)?;
        if text.trim().is_empty() {
            return Err(IngestError::EmptyDocument.into());
        }

        let chunks = self.chunker.split(text);
        if chunks.is_empty() {
            return Err(IngestError::EmptyDocument.into());
        }

        let lock = self.collection_lock(collection).await;
        let guard = lock.lock().await;
        let batch_id = Uuid::new_v4();
        let stored = self.store_batch(collection, &chunks, batch_id).await;
        drop(guard);
        self.release_lock(collection, lock).await;
        let first_ordinal = stored?;

        info!(
            %batch_id,
            collection,
            chunk_count = chunks.len(),
            first_ordinal,
            "ingestion finished"
        );

        Ok(IngestReport {
            collection: collection.to_string(),
            batch_id,
            chunk_count: chunks.len(),
            first_ordinal,
            finished_at: Utc::now(),
        })
    }

    /// Up to `k` chunk texts, best match first. The collection must exist.
    pub async fn retrieve(
        &self,
        question: &str,
        collection: &str,
        k: usize,
    ) -> Result<Vec<String>, RetrievalError> {
        let hits = self.retrieve_scored(question, collection, k).await?;
        Ok(hits.into_iter().map(|hit| hit.text).collect())
    }

    pub async fn retrieve_scored(
        &self,
        question: &str,
        collection: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        if question.trim().is_empty() {
            return Err(RetrievalError::InvalidArgument("question is empty".to_string()));
        }

        self.store.get(collection).await?;
        let query_vector = self.embedder.embed(question).await?;
        let hits = self.store.query_scored(collection, &query_vector, k).await?;
        debug!(collection, k, hits = hits.len(), "retrieved chunks");
        Ok(hits)
    }

    /// Deletes a collection once any in-flight ingestion into it has finished.
    pub async fn delete_collection(&self, collection: &str) -> Result<bool, RetrievalError> {
        validate_collection_name(collection)?;
        let lock = self.collection_lock(collection).await;
        let guard = lock.lock().await;
        let deleted = self.store.delete(collection).await;
        drop(guard);
        self.release_lock(collection, lock).await;
        Ok(deleted?)
    }

    /// Stores `chunks` under consecutive ordinals and returns the first one.
    /// The caller holds the collection's ingestion lock.
    async fn store_batch(
        &self,
        collection: &str,
        chunks: &[String],
        batch_id: Uuid,
    ) -> Result<u64, RetrievalError> {
        let target = self.resolve_or_create(collection).await?;
        let first_ordinal = target.chunk_count;

        for (offset, chunk) in chunks.iter().enumerate() {
            let id = chunk_id(collection, first_ordinal + offset as u64);
            let vector = self.embedder.embed(chunk).await?;
            self.store.add(collection, &id, chunk, &vector).await?;
            debug!(%batch_id, collection, chunk_id = %id, "ingested chunk");
        }

        Ok(first_ordinal)
    }

    async fn resolve_or_create(&self, collection: &str) -> Result<Collection, StoreError> {
        match self.store.get(collection).await {
            Ok(existing) => Ok(existing),
            Err(StoreError::CollectionNotFound(_)) => match self.store.create(collection).await {
                Ok(created) => Ok(created),
                Err(StoreError::CollectionExists(_)) => self.store.get(collection).await,
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        }
    }

    async fn collection_lock(&self, collection: &str) -> Arc<Mutex<()>> {
        let mut locks = self.ingest_locks.lock().await;
        Arc::clone(locks.entry(collection.to_string()).or_default())
    }

    /// Drops the map entry once no other caller holds or waits on the lock.
    async fn release_lock(&self, collection: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.ingest_locks.lock().await;
        if locks
            .get(collection)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(collection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::testing::WordCounter;
    use crate::chunking::ChunkingConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::extractor::fixtures::pdf_with_pages;
    use crate::stores::{SqliteCollectionStore, StoreSettings};
    use crate::{DistanceMetric, EmbeddingError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const DIMS: usize = 64;

    fn store_in(dir: &TempDir) -> SqliteCollectionStore {
        SqliteCollectionStore::open(
            dir.path().join("store.sqlite3"),
            StoreSettings {
                dimensions: DIMS,
                metric: DistanceMetric::Cosine,
                embedding_model: crate::CHARACTER_NGRAM_MODEL_ID.to_string(),
            },
        )
        .expect("store should open")
    }

    fn word_chunker(max_tokens: usize, overlap_tokens: usize) -> TextChunker<WordCounter> {
        TextChunker::new(
            ChunkingConfig {
                max_tokens,
                overlap_tokens,
                ..ChunkingConfig::default()
            },
            WordCounter,
        )
        .expect("valid chunking config")
    }

    fn engine_in(
        dir: &TempDir,
    ) -> RetrievalEngine<SqliteCollectionStore, CharacterNgramEmbedder, WordCounter> {
        RetrievalEngine::new(
            store_in(dir),
            CharacterNgramEmbedder::new(DIMS),
            word_chunker(300, 20),
        )
        .expect("engine should build")
    }

    fn itinerary_text(lines: usize) -> String {
        (0..lines)
            .map(|day| format!("Day {day} visit museum number {day} dinner at trattoria {day}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn five_hundred_token_document_yields_two_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);

        // 50 lines of 10 words: 500 tokens under the word counter.
        let text = itinerary_text(50);
        assert_eq!(engine.chunker().token_count(&text), 500);

        let report = engine.ingest_text(&text, "trip").await?;
        assert_eq!(report.chunk_count, 2);
        assert_eq!(report.first_ordinal, 0);
        assert_eq!(
            engine.store().chunk_ids("trip").await?,
            vec!["trip_chunk_0".to_string(), "trip_chunk_1".to_string()]
        );

        let first_chunk = engine.chunker().split(&text)[0].clone();
        let top = engine.retrieve(&first_chunk, "trip", 1).await?;
        assert_eq!(top, vec![first_chunk]);
        Ok(())
    }

    #[tokio::test]
    async fn pdf_ingestion_creates_collection_and_counts_chunks() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);
        let pdf = pdf_with_pages(&[&["Rome: Colosseum at nine"], &["Florence: Uffizi at ten"]]);

        let count = engine.ingest(pdf, "italy").await?;
        assert_eq!(count, 1);
        assert_eq!(engine.store().count("italy").await?, 1);

        let hits = engine.retrieve("Uffizi", "italy", 3).await?;
        assert_eq!(hits, vec!["Rome: Colosseum at nine\nFlorence: Uffizi at ten".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn reingestion_continues_ordinals() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);

        engine.ingest_text("first upload", "trip").await?;
        let second = engine.ingest_text("second upload", "trip").await?;

        assert_eq!(second.first_ordinal, 1);
        assert_eq!(
            engine.store().chunk_ids("trip").await?,
            vec!["trip_chunk_0".to_string(), "trip_chunk_1".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_document_stores_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);
        let blank_pdf = pdf_with_pages(&[&[], &["  "]]);

        let result = engine.ingest(blank_pdf, "blank").await;
        assert!(matches!(
            result,
            Err(RetrievalError::Ingest(IngestError::EmptyDocument))
        ));
        assert!(engine.store().list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_pdf_propagates_extraction_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);
        let result = engine.ingest(b"not a pdf".to_vec(), "broken").await;
        assert!(matches!(
            result,
            Err(RetrievalError::Ingest(IngestError::Extraction(_)))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn retrieve_requires_existing_collection() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);

        let missing = engine.retrieve("where is the hotel", "nowhere", 3).await;
        assert!(missing.as_ref().is_err_and(RetrievalError::is_not_found));
        assert!(engine.store().list().await?.is_empty());

        engine.store().create("empty").await?;
        assert!(engine.retrieve("where is the hotel", "empty", 3).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn blank_question_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);
        engine.store().create("trip").await?;
        assert!(matches!(
            engine.retrieve("   ", "trip", 3).await,
            Err(RetrievalError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn collections_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);
        engine.ingest_text("Gelato tasting in Bologna", "food").await?;
        engine.ingest_text("Hiking the Dolomites", "outdoors").await?;

        let food = engine.retrieve("Hiking the Dolomites", "food", 5).await?;
        assert_eq!(food, vec!["Gelato tasting in Bologna".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_embedder_is_refused() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let result = RetrievalEngine::new(
            store_in(&dir),
            CharacterNgramEmbedder::new(DIMS * 2),
            word_chunker(300, 20),
        );
        assert!(matches!(
            result,
            Err(RetrievalError::Store(StoreError::DimensionMismatch { .. }))
        ));
        Ok(())
    }

    struct FailingEmbedder {
        inner: CharacterNgramEmbedder,
        succeed: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.succeed {
                return Err(EmbeddingError::BackendResponse {
                    backend: "test".to_string(),
                    details: "503 Service Unavailable".to_string(),
                });
            }
            self.inner.embed(text).await
        }
    }

    #[tokio::test]
    async fn failure_mid_batch_keeps_stored_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = RetrievalEngine::new(
            store_in(&dir),
            FailingEmbedder {
                inner: CharacterNgramEmbedder::new(DIMS),
                succeed: 1,
                calls: AtomicUsize::new(0),
            },
            word_chunker(10, 0),
        )?;

        let result = engine.ingest_text(&itinerary_text(3), "trip").await;
        assert!(matches!(result, Err(RetrievalError::Embedding(_))));
        assert_eq!(engine.store().chunk_ids("trip").await?, vec!["trip_chunk_0".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_ingestions_into_one_collection_do_not_collide(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(engine_in(&dir));

        let uploads = (0..4)
            .map(|upload| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .ingest_text(&format!("upload number {upload}"), "shared")
                        .await
                        .map(|report| report.chunk_count)
                })
            })
            .collect::<Vec<_>>();

        for upload in uploads {
            assert_eq!(upload.await??, 1);
        }

        let mut ids = engine.store().chunk_ids("shared").await?;
        ids.sort();
        assert_eq!(
            ids,
            (0..4).map(|ordinal| chunk_id("shared", ordinal)).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[tokio::test]
    async fn delete_then_reingest_starts_fresh() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);
        engine.ingest_text("old itinerary", "trip").await?;

        assert!(engine.delete_collection("trip").await?);
        let report = engine.ingest_text("new itinerary", "trip").await?;
        assert_eq!(report.first_ordinal, 0);
        assert_eq!(engine.retrieve("itinerary", "trip", 5).await?, vec!["new itinerary".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_their_callers() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let engine = engine_in(&dir);

        for attempt in 0..50 {
            assert!(!engine.delete_collection(&format!("absent_{attempt}")).await?);
        }
        let invalid = engine.delete_collection("no spaces allowed").await;
        assert!(matches!(
            invalid,
            Err(RetrievalError::Store(StoreError::InvalidCollectionName(_)))
        ));

        engine.ingest_text("Amalfi coast boat tour", "amalfi").await?;
        assert!(engine.ingest_text("ferry", "bad name!").await.is_err());
        assert!(engine.ingest_locks.lock().await.is_empty());

        assert!(engine.delete_collection("amalfi").await?);
        assert!(engine.ingest_locks.lock().await.is_empty());
        Ok(())
    }
}
