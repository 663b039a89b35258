//! Core data models used throughout corpusqa.
//!
//! These types represent the chunks, retrieval candidates, and conversation
//! turns that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Categorical metadata attached to every chunk at ingest time.
///
/// `source_file` identifies the originating document and is the key used by
/// [`delete_by_source`](crate::index::ChunkIndex::delete_by_source). The
/// remaining fields are optional tags usable as retrieval-time equality
/// filters; they never participate in fusion or rerank scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_file: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub knowledge_type: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
}

/// A passage of document text stored in the index.
///
/// A *child* chunk carries a `parent_id` pointing at the enclosing parent
/// passage in the blob store; a *parent* chunk has none and is the unit
/// returned to the generation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub parent_id: Option<String>,
}

impl Chunk {
    /// Key used to de-duplicate fused results: the parent id when present,
    /// otherwise a hash of the chunk text. Guarantees at most one result per
    /// logical document per query.
    pub fn dedup_key(&self) -> String {
        match &self.parent_id {
            Some(id) => id.clone(),
            None => content_hash(&self.text),
        }
    }
}

/// Which retrieval path produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalSource {
    Dense,
    Sparse,
}

/// A scored candidate produced by one retrieval path. Ephemeral — produced
/// per query, never persisted.
#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub chunk: Chunk,
    pub score: f64,
    pub source: RetrievalSource,
}

/// A candidate after RRF fusion, distinct by dedup key.
#[derive(Debug, Clone)]
pub struct FusedResult {
    pub dedup_key: String,
    pub rrf_score: f64,
    pub chunk: Chunk,
}

/// Speaker role within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of an append-only conversation, owned by the caller's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

/// Equality filter over chunk metadata. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub knowledge_type: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
}

impl MetadataFilter {
    pub fn by_source(source_file: &str) -> Self {
        Self {
            source_file: Some(source_file.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_file.is_none()
            && self.category.is_none()
            && self.knowledge_type.is_none()
            && self.folder.is_none()
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        if let Some(ref src) = self.source_file {
            if &metadata.source_file != src {
                return false;
            }
        }
        if let Some(ref cat) = self.category {
            if metadata.category.as_deref() != Some(cat.as_str()) {
                return false;
            }
        }
        if let Some(ref kt) = self.knowledge_type {
            if metadata.knowledge_type.as_deref() != Some(kt.as_str()) {
                return false;
            }
        }
        if let Some(ref folder) = self.folder {
            if metadata.folder.as_deref() != Some(folder.as_str()) {
                return false;
            }
        }
        true
    }
}

/// SHA-256 content hash, truncated to 16 hex chars — used as the fallback
/// dedup key for chunks without a parent id.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    full[..16].to_string()
}
