//! Hybrid retrieval with reciprocal rank fusion.
//!
//! A query runs two independent paths over the child index — dense
//! (embedding nearest-neighbor) and sparse (BM25) — whose ranked lists are
//! merged with RRF and de-duplicated per logical document. In parent-child
//! mode the winners are materialized as parent passages before the optional
//! cross-encoder rerank, so the generator always sees full context.
//!
//! Failure posture: sparse emptiness degrades to dense-only, a reranker
//! error keeps the pre-rerank order, and a dangling parent reference is
//! logged and skipped. Only embedding or store errors abort a query.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::gateway::{embed_one, Reranker};
use crate::index::ChunkIndex;
use crate::models::{Chunk, FusedResult, MetadataFilter, RetrievalCandidate, RetrievalSource};

/// RRF rank constant. Dampens the contribution gap between adjacent ranks
/// so agreement between paths outweighs a single path's top position.
pub const RRF_K: f64 = 60.0;

/// Fetch multiplier when a reranker will narrow the pool afterwards.
const FETCH_MULT_RERANKED: usize = 10;
/// Fetch multiplier without a reranker.
const FETCH_MULT_PLAIN: usize = 5;

/// Merge ranked candidate lists with reciprocal rank fusion.
///
/// Each list entry is `(dedup_key, chunk)` in rank order, best first. A key
/// appearing in several lists accumulates `1 / (RRF_K + rank)` per list
/// (ranks are 1-indexed); the first chunk seen for a key is retained.
pub fn rrf_fuse(lists: &[Vec<(String, Chunk)>]) -> Vec<FusedResult> {
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut fused: Vec<FusedResult> = Vec::new();

    for list in lists {
        for (rank, (key, chunk)) in list.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (rank + 1) as f64);
            match by_key.get(key) {
                Some(&i) => fused[i].rrf_score += contribution,
                None => {
                    by_key.insert(key.clone(), fused.len());
                    fused.push(FusedResult {
                        dedup_key: key.clone(),
                        rrf_score: contribution,
                        chunk: chunk.clone(),
                    });
                }
            }
        }
    }

    fused.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    fused
}

pub struct RetrievalFusionEngine {
    index: Arc<ChunkIndex>,
    reranker: Option<Arc<dyn Reranker>>,
    rerank_max_candidates: usize,
}

impl RetrievalFusionEngine {
    pub fn new(
        index: Arc<ChunkIndex>,
        reranker: Option<Arc<dyn Reranker>>,
        rerank_max_candidates: usize,
    ) -> Self {
        Self {
            index,
            reranker,
            rerank_max_candidates,
        }
    }

    pub fn index(&self) -> &Arc<ChunkIndex> {
        &self.index
    }

    fn fetch_k(&self, k: usize) -> usize {
        let mult = if self.reranker.is_some() {
            FETCH_MULT_RERANKED
        } else {
            FETCH_MULT_PLAIN
        };
        k.max(1) * mult
    }

    /// Retrieve the top `k` passages for `query`.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Chunk>> {
        if self.index.is_empty().await? {
            return Ok(Vec::new());
        }

        let fetch_k = self.fetch_k(k);

        // Dense path: nearest children by cosine.
        let query_vec = embed_one(self.index.embedder(), query)
            .await
            .context("Failed to embed query")?;
        let dense: Vec<RetrievalCandidate> = self
            .index
            .dense_search(&query_vec, fetch_k, filter)
            .await?
            .into_iter()
            .map(|hit| RetrievalCandidate {
                score: hit.similarity as f64,
                chunk: hit.chunk,
                source: RetrievalSource::Dense,
            })
            .collect();
        let dense_list: Vec<(String, Chunk)> = dense
            .into_iter()
            .map(|c| (c.chunk.dedup_key(), c.chunk))
            .collect();

        // Sparse path: BM25 over children, upgraded to parents so both
        // paths key on the same logical document.
        let sparse: Vec<RetrievalCandidate> = self
            .index
            .sparse_search(query, fetch_k, filter)
            .await
            .into_iter()
            .map(|(chunk, score)| RetrievalCandidate {
                chunk,
                score,
                source: RetrievalSource::Sparse,
            })
            .collect();
        let sparse_list = self.upgrade_sparse(sparse).await;

        let fused = rrf_fuse(&[dense_list, sparse_list]);
        let candidates = self.materialize(fused).await;

        let reranked = self.maybe_rerank(query, candidates).await;
        Ok(reranked.into_iter().take(k).collect())
    }

    /// Upgrade sparse child hits to their parents, preserving rank order and
    /// de-duplicating within the path. Hits without a parent stay as-is.
    async fn upgrade_sparse(&self, hits: Vec<RetrievalCandidate>) -> Vec<(String, Chunk)> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut upgraded = Vec::with_capacity(hits.len());

        for RetrievalCandidate { chunk, .. } in hits {
            match &chunk.parent_id {
                Some(parent_id) => {
                    if !seen.insert(parent_id.clone()) {
                        continue;
                    }
                    match self.index.get_parent(parent_id).await {
                        Ok(Some(parent)) => upgraded.push((parent_id.clone(), parent)),
                        Ok(None) => {
                            tracing::warn!(
                                parent_id = %parent_id,
                                child_id = %chunk.id,
                                "Child references a missing parent, skipping"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                parent_id = %parent_id,
                                error = %e,
                                "Failed to load parent for sparse hit, skipping"
                            );
                        }
                    }
                }
                None => {
                    let key = chunk.dedup_key();
                    if seen.insert(key.clone()) {
                        upgraded.push((key, chunk));
                    }
                }
            }
        }

        upgraded
    }

    /// Resolve fused winners to the passages handed to generation: parents
    /// in parent-child mode, the chunks themselves otherwise.
    async fn materialize(&self, fused: Vec<FusedResult>) -> Vec<Chunk> {
        let mut out = Vec::with_capacity(fused.len());
        for result in fused {
            match &result.chunk.parent_id {
                Some(parent_id) => match self.index.get_parent(parent_id).await {
                    Ok(Some(parent)) => out.push(parent),
                    Ok(None) => {
                        tracing::warn!(
                            parent_id = %parent_id,
                            "Fused result references a missing parent, skipping"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(parent_id = %parent_id, error = %e, "Parent load failed, skipping");
                    }
                },
                None => out.push(result.chunk),
            }
        }
        out
    }

    /// Rerank the top candidates with the cross-encoder when configured.
    /// Any reranker failure keeps the fusion order.
    async fn maybe_rerank(&self, query: &str, candidates: Vec<Chunk>) -> Vec<Chunk> {
        let reranker = match &self.reranker {
            Some(r) => r,
            None => return candidates,
        };
        if candidates.is_empty() {
            return candidates;
        }

        let cutoff = self.rerank_max_candidates.min(candidates.len());
        let (head, tail) = candidates.split_at(cutoff);
        let texts: Vec<String> = head.iter().map(|c| c.text.clone()).collect();

        match reranker.score(query, &texts).await {
            Ok(scores) if scores.len() == head.len() => {
                let mut scored: Vec<(f32, Chunk)> = scores
                    .into_iter()
                    .zip(head.iter().cloned())
                    .collect();
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                scored
                    .into_iter()
                    .map(|(_, c)| c)
                    .chain(tail.iter().cloned())
                    .collect()
            }
            Ok(scores) => {
                tracing::warn!(
                    expected = head.len(),
                    got = scores.len(),
                    "Reranker returned wrong score count, keeping fusion order"
                );
                candidates
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reranker failed, keeping fusion order");
                candidates
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use crate::gateway::HashEmbedder;
    use crate::models::ChunkMetadata;
    use crate::store::memory::{MemoryBlobStore, MemoryVectorStore};

    fn chunk(id: &str, text: &str, parent_id: Option<&str>) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                source_file: "test.md".to_string(),
                ..Default::default()
            },
            parent_id: parent_id.map(|p| p.to_string()),
        }
    }

    fn keyed(chunks: &[Chunk]) -> Vec<(String, Chunk)> {
        chunks.iter().map(|c| (c.dedup_key(), c.clone())).collect()
    }

    #[test]
    fn test_rrf_agreement_beats_single_list_top() {
        // "b" is second in both lists; "a" and "c" each top one list.
        let list1 = keyed(&[chunk("a", "a text", None), chunk("b", "b text", None)]);
        let list2 = keyed(&[chunk("c", "c text", None), chunk("b", "b text", None)]);
        let fused = rrf_fuse(&[list1, list2]);
        assert_eq!(fused[0].chunk.id, "b");
        let expected = 2.0 * (1.0 / 62.0);
        assert!((fused[0].rrf_score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_single_list_preserves_order() {
        let list = keyed(&[
            chunk("a", "first", None),
            chunk("b", "second", None),
            chunk("c", "third", None),
        ]);
        let fused = rrf_fuse(&[list]);
        let ids: Vec<&str> = fused.iter().map(|f| f.chunk.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_rrf_dedups_children_of_same_parent() {
        // Two children of parent p1 ranked 1 and 2 in the dense list.
        let list = keyed(&[
            chunk("c1", "child one", Some("p1")),
            chunk("c2", "child two", Some("p1")),
            chunk("c3", "other", Some("p2")),
        ]);
        let fused = rrf_fuse(&[list]);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].dedup_key, "p1");
        // Accumulates both ranks.
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].rrf_score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_empty_input() {
        assert!(rrf_fuse(&[]).is_empty());
        assert!(rrf_fuse(&[Vec::new(), Vec::new()]).is_empty());
    }

    async fn seeded_engine() -> RetrievalFusionEngine {
        let chunking = ChunkingConfig {
            parent_chars: 300,
            parent_overlap: 0,
            child_chars: 100,
            child_overlap: 0,
            ..Default::default()
        };
        let index = Arc::new(ChunkIndex::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(HashEmbedder::new(256)),
            chunking,
        ));
        let meta = |s: &str| ChunkMetadata {
            source_file: s.to_string(),
            ..Default::default()
        };
        index
            .ingest(
                "The zanzibar authorization system stores relation tuples. \
                 Relation tuples model object to user relationships. \
                 Consistency is provided through zookie tokens.",
                meta("zanzibar.md"),
            )
            .await
            .unwrap();
        index
            .ingest(
                "Sourdough bread needs a mature starter. \
                 Feed the starter with flour and water daily. \
                 Long fermentation develops flavor in the loaf.",
                meta("bread.md"),
            )
            .await
            .unwrap();
        RetrievalFusionEngine::new(index, None, 100)
    }

    #[tokio::test]
    async fn test_retrieve_returns_parents_not_children() {
        let engine = seeded_engine().await;
        let results = engine
            .retrieve("zanzibar relation tuples", 2, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(!results.is_empty());
        for chunk in &results {
            assert!(chunk.parent_id.is_none(), "child leaked to caller");
        }
        assert_eq!(results[0].metadata.source_file, "zanzibar.md");
    }

    #[tokio::test]
    async fn test_retrieve_distinct_logical_documents() {
        let engine = seeded_engine().await;
        let results = engine
            .retrieve("zanzibar tuples", 10, &MetadataFilter::default())
            .await
            .unwrap();
        let mut keys: Vec<String> = results.iter().map(|c| c.dedup_key()).collect();
        let before = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), before, "duplicate logical documents returned");
    }

    #[tokio::test]
    async fn test_empty_corpus_returns_empty() {
        let chunking = ChunkingConfig::default();
        let index = Arc::new(ChunkIndex::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(HashEmbedder::new(64)),
            chunking,
        ));
        let engine = RetrievalFusionEngine::new(index, None, 100);
        let results = engine
            .retrieve("anything", 4, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_filter_restricts_retrieval() {
        let engine = seeded_engine().await;
        let results = engine
            .retrieve(
                "zanzibar tuples",
                5,
                &MetadataFilter::by_source("bread.md"),
            )
            .await
            .unwrap();
        assert!(results
            .iter()
            .all(|c| c.metadata.source_file == "bread.md"));
    }

    struct FailingReranker;

    #[async_trait::async_trait]
    impl Reranker for FailingReranker {
        async fn score(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>> {
            anyhow::bail!("reranker offline")
        }
    }

    #[tokio::test]
    async fn test_reranker_failure_keeps_fusion_order() {
        let engine = seeded_engine().await;
        let plain = engine
            .retrieve("zanzibar relation tuples", 3, &MetadataFilter::default())
            .await
            .unwrap();

        let failing = RetrievalFusionEngine::new(engine.index.clone(), Some(Arc::new(FailingReranker)), 100);
        let degraded = failing
            .retrieve("zanzibar relation tuples", 3, &MetadataFilter::default())
            .await
            .unwrap();

        let ids = |v: &[Chunk]| v.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&plain), ids(&degraded));
    }

    struct ReverseReranker;

    #[async_trait::async_trait]
    impl Reranker for ReverseReranker {
        async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>> {
            // Lower original rank gets the higher score.
            Ok((0..texts.len()).map(|i| i as f32).collect())
        }
    }

    #[tokio::test]
    async fn test_reranker_reorders_candidates() {
        let engine = seeded_engine().await;
        let plain = engine
            .retrieve("starter zanzibar", 4, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(plain.len() >= 2);

        let reranked_engine = RetrievalFusionEngine::new(
            engine.index.clone(),
            Some(Arc::new(ReverseReranker)),
            100,
        );
        let reranked = reranked_engine
            .retrieve("starter zanzibar", 4, &MetadataFilter::default())
            .await
            .unwrap();

        let ids = |v: &[Chunk]| v.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        let mut reversed = ids(&reranked);
        reversed.reverse();
        assert_eq!(ids(&plain), reversed);
    }
}
