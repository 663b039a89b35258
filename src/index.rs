//! Two-tier chunk index.
//!
//! Documents are split into parent passages, each parent into overlapping
//! child passages. Children are embedded and stored in the vector store
//! carrying a `parent_id`; parent payloads go to the blob store. Retrieval
//! searches children for precision and upgrades hits to parents for context.
//!
//! Write ordering: parents are persisted before their children, so a stored
//! child never references a missing parent. The BM25 sparse index is rebuilt
//! in full after every mutation.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::chunker;
use crate::config::ChunkingConfig;
use crate::gateway::Embedder;
use crate::models::{Chunk, ChunkMetadata, MetadataFilter};
use crate::sparse::SparseIndex;
use crate::store::{BlobStore, ScoredChunk, VectorStore};

/// Counts reported by a successful ingest.
#[derive(Debug, Clone, Copy)]
pub struct IngestStats {
    pub parents: usize,
    pub children: usize,
}

/// Counts reported by a delete.
#[derive(Debug, Clone, Copy)]
pub struct DeleteStats {
    pub children: usize,
    pub parents: usize,
}

pub struct ChunkIndex {
    vectors: Arc<dyn VectorStore>,
    blobs: Arc<dyn BlobStore>,
    embedder: Arc<dyn Embedder>,
    sparse: RwLock<SparseIndex>,
    chunking: ChunkingConfig,
}

impl ChunkIndex {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        blobs: Arc<dyn BlobStore>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            vectors,
            blobs,
            embedder,
            sparse: RwLock::new(SparseIndex::new()),
            chunking,
        }
    }

    pub fn parent_child(&self) -> bool {
        self.chunking.parent_child
    }

    /// Rebuild the sparse index from the vector store. Called automatically
    /// after mutations; call once at startup to hydrate from durable storage.
    pub async fn rebuild_sparse(&self) -> Result<()> {
        let chunks = self.vectors.get(&MetadataFilter::default()).await?;
        self.sparse.write().await.rebuild(chunks);
        Ok(())
    }

    /// Ingest one document: split, embed, persist. Atomic from the caller's
    /// view — on failure no children from this call remain queryable, and
    /// any already-written parent blobs are removed.
    pub async fn ingest(&self, text: &str, metadata: ChunkMetadata) -> Result<IngestStats> {
        let parent_texts = chunker::split_parents(self.embedder.as_ref(), &self.chunking, text)
            .await
            .context("Failed to split document")?;
        if parent_texts.is_empty() {
            return Ok(IngestStats {
                parents: 0,
                children: 0,
            });
        }

        let mut children: Vec<Chunk> = Vec::new();
        let mut parent_ids: Vec<String> = Vec::new();

        if self.chunking.parent_child {
            for parent_text in &parent_texts {
                let parent_id = Uuid::new_v4().to_string();
                let parent = Chunk {
                    id: parent_id.clone(),
                    text: parent_text.clone(),
                    metadata: metadata.clone(),
                    parent_id: None,
                };
                let payload =
                    serde_json::to_vec(&parent).context("Failed to serialize parent chunk")?;
                // Parent first, so no child can ever reference a missing one.
                self.blobs.put(&parent_id, &payload).await?;
                parent_ids.push(parent_id.clone());

                for child_text in chunker::split_children(&self.chunking, parent_text) {
                    children.push(Chunk {
                        id: Uuid::new_v4().to_string(),
                        text: child_text,
                        metadata: metadata.clone(),
                        parent_id: Some(parent_id.clone()),
                    });
                }
            }
        } else {
            // Single-tier mode: parent-sized chunks are indexed directly.
            for parent_text in &parent_texts {
                children.push(Chunk {
                    id: Uuid::new_v4().to_string(),
                    text: parent_text.clone(),
                    metadata: metadata.clone(),
                    parent_id: None,
                });
            }
        }

        let texts: Vec<String> = children.iter().map(|c| c.text.clone()).collect();
        let embed_and_store = async {
            let vectors = self.embedder.embed(&texts).await?;
            self.vectors.add(&children, &vectors).await
        };

        if let Err(e) = embed_and_store.await {
            for parent_id in &parent_ids {
                if let Err(cleanup_err) = self.blobs.delete(parent_id).await {
                    tracing::warn!(
                        parent_id = %parent_id,
                        error = %cleanup_err,
                        "Failed to clean up parent blob after aborted ingest"
                    );
                }
            }
            return Err(e).context("Failed to index document");
        }

        self.rebuild_sparse().await?;
        let parents = if self.chunking.parent_child {
            parent_ids.len()
        } else {
            children.len()
        };
        Ok(IngestStats {
            parents,
            children: children.len(),
        })
    }

    /// Fetch a parent passage by id.
    pub async fn get_parent(&self, id: &str) -> Result<Option<Chunk>> {
        match self.blobs.get(id).await? {
            Some(bytes) => {
                let chunk =
                    serde_json::from_slice(&bytes).context("Corrupt parent chunk payload")?;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Delete every chunk belonging to `source_file`, children first. A
    /// parent blob that fails to delete is logged and skipped — the children
    /// are authoritative, so an orphaned blob is unreachable garbage, not an
    /// inconsistency.
    pub async fn delete_by_source(&self, source_file: &str) -> Result<DeleteStats> {
        let deleted = self
            .vectors
            .delete_by_metadata(&MetadataFilter::by_source(source_file))
            .await?;

        let mut parent_ids: Vec<String> = deleted
            .iter()
            .filter_map(|c| c.parent_id.clone())
            .collect();
        parent_ids.sort();
        parent_ids.dedup();

        let mut parents_deleted = 0usize;
        for parent_id in &parent_ids {
            match self.blobs.delete(parent_id).await {
                Ok(true) => parents_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        parent_id = %parent_id,
                        error = %e,
                        "Failed to delete parent blob, skipping"
                    );
                }
            }
        }

        self.rebuild_sparse().await?;
        Ok(DeleteStats {
            children: deleted.len(),
            parents: parents_deleted,
        })
    }

    /// Dense retrieval: nearest child chunks to an embedded query.
    pub async fn dense_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>> {
        self.vectors.query(vector, k, filter).await
    }

    /// Sparse retrieval over the in-memory BM25 index.
    pub async fn sparse_search(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Vec<(Chunk, f64)> {
        self.sparse.read().await.search(query, k, filter)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.chunk_count().await? == 0)
    }

    pub async fn chunk_count(&self) -> Result<usize> {
        self.vectors.count().await
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::HashEmbedder;
    use crate::store::memory::{MemoryBlobStore, MemoryVectorStore};

    fn test_index(parent_child: bool) -> ChunkIndex {
        let chunking = ChunkingConfig {
            parent_child,
            parent_chars: 300,
            parent_overlap: 0,
            child_chars: 100,
            child_overlap: 20,
            ..Default::default()
        };
        ChunkIndex::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(HashEmbedder::new(64)),
            chunking,
        )
    }

    fn meta(source: &str) -> ChunkMetadata {
        ChunkMetadata {
            source_file: source.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_stores_children_with_parent_links() {
        let index = test_index(true);
        let text = "sentence about storage engines. ".repeat(30);
        let stats = index.ingest(&text, meta("doc.md")).await.unwrap();
        assert!(stats.parents >= 2);
        assert!(stats.children > stats.parents);

        let children = index
            .vectors
            .get(&MetadataFilter::default())
            .await
            .unwrap();
        for child in &children {
            let parent_id = child.parent_id.as_ref().expect("child missing parent link");
            let parent = index.get_parent(parent_id).await.unwrap().unwrap();
            assert!(parent.text.len() >= child.text.len());
            assert!(parent.parent_id.is_none());
        }
    }

    #[tokio::test]
    async fn test_single_tier_mode_has_no_parents() {
        let index = test_index(false);
        let text = "plain single tier content. ".repeat(30);
        index.ingest(&text, meta("doc.md")).await.unwrap();
        let chunks = index
            .vectors
            .get(&MetadataFilter::default())
            .await
            .unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.parent_id.is_none()));
    }

    #[tokio::test]
    async fn test_delete_by_source_removes_children_and_parents() {
        let index = test_index(true);
        index
            .ingest(&"keep this content. ".repeat(30), meta("keep.md"))
            .await
            .unwrap();
        index
            .ingest(&"drop this content. ".repeat(30), meta("drop.md"))
            .await
            .unwrap();

        let stats = index.delete_by_source("drop.md").await.unwrap();
        assert!(stats.children > 0);
        assert!(stats.parents > 0);

        let remaining = index
            .vectors
            .get(&MetadataFilter::default())
            .await
            .unwrap();
        assert!(remaining.iter().all(|c| c.metadata.source_file == "keep.md"));
        // Every surviving child still resolves to its parent.
        for child in &remaining {
            let pid = child.parent_id.as_ref().unwrap();
            assert!(index.get_parent(pid).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_sparse_index_tracks_mutations() {
        let index = test_index(true);
        index
            .ingest(
                "zanzibar is a global authorization system built at google",
                meta("zanzibar.md"),
            )
            .await
            .unwrap();
        assert!(!index
            .sparse_search("zanzibar", 5, &MetadataFilter::default())
            .await
            .is_empty());

        index.delete_by_source("zanzibar.md").await.unwrap();
        assert!(index
            .sparse_search("zanzibar", 5, &MetadataFilter::default())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_document_is_a_noop() {
        let index = test_index(true);
        let stats = index.ingest("   \n  ", meta("empty.md")).await.unwrap();
        assert_eq!(stats.children, 0);
        assert!(index.is_empty().await.unwrap());
    }
}
