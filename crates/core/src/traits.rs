use crate::{Collection, DistanceMetric, ScoredChunk, StoreError};
use async_trait::async_trait;

/// Named, isolated chunk containers with nearest-neighbour lookup. The store
/// owns every persisted chunk; callers never hold chunk state between calls.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    fn dimensions(&self) -> usize;

    fn metric(&self) -> DistanceMetric;

    /// Model whose vectors this store holds.
    fn embedding_model(&self) -> &str;

    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Fails with `CollectionExists` rather than reusing an existing name.
    async fn create(&self, name: &str) -> Result<Collection, StoreError>;

    async fn get(&self, name: &str) -> Result<Collection, StoreError>;

    async fn add(
        &self,
        name: &str,
        chunk_id: &str,
        text: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError>;

    /// Best match first; equal scores keep insertion order.
    async fn query_scored(
        &self,
        name: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    async fn query(
        &self,
        name: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<String>, StoreError> {
        let hits = self.query_scored(name, query_embedding, k).await?;
        Ok(hits.into_iter().map(|hit| hit.text).collect())
    }

    /// Returns whether a collection was removed; deleting an absent name is a no-op.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    async fn count(&self, name: &str) -> Result<u64, StoreError> {
        Ok(self.get(name).await?.chunk_count)
    }

    /// Chunk ids in insertion order.
    async fn chunk_ids(&self, name: &str) -> Result<Vec<String>, StoreError>;
}
