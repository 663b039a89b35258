//! Storage abstraction behind the chunk index.
//!
//! Two narrow contracts: [`VectorStore`] holds embedded child chunks and
//! answers nearest-neighbor queries; [`BlobStore`] holds opaque parent
//! payloads by id. Backends: [`memory`] for tests and embedded use,
//! [`sqlite`] for durable storage.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, MetadataFilter};

/// A chunk returned from a vector query together with its cosine similarity
/// to the query vector.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f32,
}

/// Store of embedded child chunks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert chunks with their embedding vectors. `chunks` and `vectors`
    /// are parallel slices of equal length.
    async fn add(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()>;

    /// Return up to `k` chunks nearest to `vector`, best first, restricted
    /// to chunks matching `filter`.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>>;

    /// Return every chunk matching `filter`, in insertion order. An empty
    /// filter returns the whole store.
    async fn get(&self, filter: &MetadataFilter) -> Result<Vec<Chunk>>;

    /// Delete every chunk matching `filter` and return the deleted chunks.
    async fn delete_by_metadata(&self, filter: &MetadataFilter) -> Result<Vec<Chunk>>;

    /// Number of stored chunks.
    async fn count(&self) -> Result<usize>;
}

/// Keyed store of opaque payloads (parent passage JSON).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, id: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a blob; returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Store of serialized suspended turns, keyed by turn id. Turns parked at
/// the human-approval gate must survive a process restart, so the payload
/// goes through the same backend as the corpus.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Park a turn, replacing any previous payload under the same id.
    async fn put(&self, turn_id: &str, body: &str) -> Result<()>;

    /// Remove a parked turn and return its payload. A turn can be resumed
    /// exactly once.
    async fn take(&self, turn_id: &str) -> Result<Option<String>>;
}
