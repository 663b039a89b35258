//! Dependency wiring.
//!
//! [`App::from_config`] builds the whole object graph once — stores,
//! collaborators, index, fusion engine, control loop — and hands it to the
//! CLI or the HTTP server. There are no globals; everything downstream
//! receives its dependencies explicitly.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::control::ControlLoop;
use crate::db;
use crate::fusion::RetrievalFusionEngine;
use crate::gateway::Gateway;
use crate::index::ChunkIndex;
use crate::migrate;
use crate::store::memory::{MemoryBlobStore, MemoryTurnStore, MemoryVectorStore};
use crate::store::sqlite::{SqliteBlobStore, SqliteTurnStore, SqliteVectorStore};
use crate::store::{BlobStore, TurnStore, VectorStore};

pub struct App {
    pub config: Config,
    pub index: Arc<ChunkIndex>,
    pub engine: Arc<RetrievalFusionEngine>,
    pub control: Arc<ControlLoop>,
    /// Durable parking for turns suspended at the human-approval gate.
    pub turns: Arc<dyn TurnStore>,
}

impl App {
    pub async fn from_config(config: Config) -> Result<Self> {
        let gateway = Gateway::from_config(&config)?;

        type Backends = (Arc<dyn VectorStore>, Arc<dyn BlobStore>, Arc<dyn TurnStore>);
        let (vectors, blobs, turns): Backends = match config.store.backend.as_str() {
            "memory" => (
                Arc::new(MemoryVectorStore::new()),
                Arc::new(MemoryBlobStore::new()),
                Arc::new(MemoryTurnStore::new()),
            ),
            "sqlite" => {
                let path = match &config.store.path {
                    Some(p) => p,
                    None => bail!("store.path is required for the sqlite backend"),
                };
                let pool = db::connect(path).await?;
                migrate::run_migrations(&pool).await?;
                (
                    Arc::new(SqliteVectorStore::new(pool.clone())),
                    Arc::new(SqliteBlobStore::new(pool.clone())),
                    Arc::new(SqliteTurnStore::new(pool)),
                )
            }
            other => bail!("Unknown store backend: {}", other),
        };

        let index = Arc::new(ChunkIndex::new(
            vectors,
            blobs,
            gateway.embedder.clone(),
            config.chunking.clone(),
        ));
        // Hydrate the lexical index from durable storage.
        index.rebuild_sparse().await?;

        let engine = Arc::new(RetrievalFusionEngine::new(
            index.clone(),
            gateway.reranker.clone(),
            config.retrieval.rerank_max_candidates,
        ));

        let control = Arc::new(ControlLoop::new(
            engine.clone(),
            gateway.generator.clone(),
            gateway.web_search.clone(),
            config.control.clone(),
            config.retrieval.top_k,
        ));

        Ok(Self {
            config,
            index,
            engine,
            control,
            turns,
        })
    }
}
