//! Shared fixtures for the integration tests: scripted collaborators and a
//! fully in-memory engine/control-loop builder.

// Each test binary compiles this module separately and uses a subset of it.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use corpusqa::config::{ChunkingConfig, ControlConfig};
use corpusqa::control::ControlLoop;
use corpusqa::fusion::RetrievalFusionEngine;
use corpusqa::gateway::{Generator, HashEmbedder, Message, WebHit, WebSearch};
use corpusqa::index::ChunkIndex;
use corpusqa::models::ChunkMetadata;
use corpusqa::store::memory::{MemoryBlobStore, MemoryVectorStore};

/// Generator that replays scripted structured replies in order. An exhausted
/// script makes further calls fail, which exercises the fail-open paths.
pub struct ScriptedGenerator {
    structured: Mutex<VecDeque<serde_json::Value>>,
    answer: Option<String>,
}

impl ScriptedGenerator {
    pub fn new(structured: Vec<serde_json::Value>, answer: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            structured: Mutex::new(structured.into()),
            answer: answer.map(|s| s.to_string()),
        })
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, _messages: &[Message]) -> Result<String> {
        match &self.answer {
            Some(a) => Ok(a.clone()),
            None => anyhow::bail!("model offline"),
        }
    }

    async fn complete_structured(
        &self,
        _messages: &[Message],
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.structured
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("model offline"))
    }
}

/// Web search returning a fixed hit list, or an error when `hits` is `None`.
pub struct StubWebSearch {
    pub hits: Option<Vec<WebHit>>,
}

#[async_trait]
impl WebSearch for StubWebSearch {
    async fn search(&self, _query: &str) -> Result<Vec<WebHit>> {
        match &self.hits {
            Some(hits) => Ok(hits.clone()),
            None => anyhow::bail!("search provider down"),
        }
    }
}

pub fn web_hit(title: &str, url: &str) -> WebHit {
    WebHit {
        title: title.to_string(),
        snippet: format!("{} snippet", title),
        url: url.to_string(),
    }
}

pub fn meta(source: &str) -> ChunkMetadata {
    ChunkMetadata {
        source_file: source.to_string(),
        ..Default::default()
    }
}

/// An in-memory index with small chunk sizes suitable for short fixtures.
pub fn memory_index() -> Arc<ChunkIndex> {
    let chunking = ChunkingConfig {
        parent_chars: 300,
        parent_overlap: 0,
        child_chars: 100,
        child_overlap: 20,
        ..Default::default()
    };
    Arc::new(ChunkIndex::new(
        Arc::new(MemoryVectorStore::new()),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(HashEmbedder::new(256)),
        chunking,
    ))
}

pub async fn seeded_index() -> Arc<ChunkIndex> {
    let index = memory_index();
    index
        .ingest(
            "Refunds are available within thirty days of purchase. Contact \
             support with the order number to start a refund. Refunds are \
             issued to the original payment method.",
            meta("refunds.md"),
        )
        .await
        .unwrap();
    index
        .ingest(
            "Shipping takes three to five business days inside the country. \
             International shipping takes up to two weeks. Expedited \
             shipping is available at checkout.",
            meta("shipping.md"),
        )
        .await
        .unwrap();
    index
}

pub fn engine(index: Arc<ChunkIndex>) -> Arc<RetrievalFusionEngine> {
    Arc::new(RetrievalFusionEngine::new(index, None, 100))
}

pub fn control_loop(
    engine: Arc<RetrievalFusionEngine>,
    generator: Arc<dyn Generator>,
    web: Option<Arc<dyn WebSearch>>,
    config: ControlConfig,
) -> ControlLoop {
    ControlLoop::new(engine, generator, web, config, 4)
}
