//! In-memory storage backend.
//!
//! Brute-force cosine scan over a `Vec` behind an async `RwLock`. Intended
//! for tests and small embedded corpora; the SQLite backend is the durable
//! default.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::gateway::cosine_similarity;
use crate::models::{Chunk, MetadataFilter};
use crate::store::{BlobStore, ScoredChunk, TurnStore, VectorStore};

#[derive(Default)]
pub struct MemoryVectorStore {
    rows: RwLock<Vec<(Chunk, Vec<f32>)>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn add(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != vectors.len() {
            bail!(
                "Chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        let mut rows = self.rows.write().await;
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            rows.push((chunk.clone(), vector.clone()));
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = self.rows.read().await;
        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .filter(|(chunk, _)| filter.matches(&chunk.metadata))
            .map(|(chunk, v)| ScoredChunk {
                chunk: chunk.clone(),
                similarity: cosine_similarity(vector, v),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn get(&self, filter: &MetadataFilter) -> Result<Vec<Chunk>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|(chunk, _)| filter.matches(&chunk.metadata))
            .map(|(chunk, _)| chunk.clone())
            .collect())
    }

    async fn delete_by_metadata(&self, filter: &MetadataFilter) -> Result<Vec<Chunk>> {
        let mut rows = self.rows.write().await;
        let mut deleted = Vec::new();
        rows.retain(|(chunk, _)| {
            if filter.matches(&chunk.metadata) {
                deleted.push(chunk.clone());
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().await.len())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryTurnStore {
    turns: RwLock<HashMap<String, String>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn put(&self, turn_id: &str, body: &str) -> Result<()> {
        self.turns
            .write()
            .await
            .insert(turn_id.to_string(), body.to_string());
        Ok(())
    }

    async fn take(&self, turn_id: &str) -> Result<Option<String>> {
        Ok(self.turns.write().await.remove(turn_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn chunk(id: &str, text: &str, source: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                source_file: source.to_string(),
                ..Default::default()
            },
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn test_query_orders_by_similarity() {
        let store = MemoryVectorStore::new();
        store
            .add(
                &[chunk("a", "x", "s"), chunk("b", "y", "s")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .await
            .unwrap();

        let results = store
            .query(&[0.9, 0.1], 2, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.id, "a");
        assert!(results[0].similarity > results[1].similarity);
    }

    #[tokio::test]
    async fn test_query_respects_filter() {
        let store = MemoryVectorStore::new();
        store
            .add(
                &[chunk("a", "x", "one.md"), chunk("b", "y", "two.md")],
                &[vec![1.0, 0.0], vec![1.0, 0.0]],
            )
            .await
            .unwrap();

        let results = store
            .query(&[1.0, 0.0], 10, &MetadataFilter::by_source("two.md"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, "b");
    }

    #[tokio::test]
    async fn test_delete_by_metadata_returns_deleted() {
        let store = MemoryVectorStore::new();
        store
            .add(
                &[chunk("a", "x", "one.md"), chunk("b", "y", "two.md")],
                &[vec![1.0], vec![1.0]],
            )
            .await
            .unwrap();

        let deleted = store
            .delete_by_metadata(&MetadataFilter::by_source("one.md"))
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, "a");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_add_rejected() {
        let store = MemoryVectorStore::new();
        let result = store.add(&[chunk("a", "x", "s")], &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_blob_roundtrip_and_delete() {
        let store = MemoryBlobStore::new();
        store.put("p1", b"payload").await.unwrap();
        assert_eq!(store.get("p1").await.unwrap().unwrap(), b"payload");
        assert!(store.delete("p1").await.unwrap());
        assert!(!store.delete("p1").await.unwrap());
        assert!(store.get("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_turn_take_is_single_shot() {
        let store = MemoryTurnStore::new();
        store.put("t-1", "{\"turn\":1}").await.unwrap();
        assert_eq!(
            store.take("t-1").await.unwrap().as_deref(),
            Some("{\"turn\":1}")
        );
        assert!(store.take("t-1").await.unwrap().is_none());
    }
}
