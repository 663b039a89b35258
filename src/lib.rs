//! # corpusqa
//!
//! A grounded question-answering engine over your own documents.
//!
//! corpusqa ingests documents into a two-tier parent/child chunk index,
//! answers queries with hybrid retrieval (dense embeddings + BM25, fused
//! with reciprocal rank fusion, optionally cross-encoder reranked), and
//! drives generation through an adaptive control loop that grades retrieved
//! material, rewrites failing queries, escalates to web search, optionally
//! pauses for human approval, and checks the final answer for grounding
//! before returning it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌───────────────┐
//! │  Ingest  │──▶│  ChunkIndex    │──▶│ FusionEngine   │
//! │ (chunk + │   │ children: vec │   │ dense ⊕ BM25  │
//! │  embed)  │   │ parents: blob │   │ RRF → rerank  │
//! └──────────┘   └───────────────┘   └──────┬────────┘
//!                                           │
//!                                    ┌──────▼────────┐
//!                                    │  ControlLoop   │
//!                                    │ grade→generate│
//!                                    │ →check quality│
//!                                    └──────┬────────┘
//!                            ┌──────────────┤
//!                            ▼              ▼
//!                       ┌─────────┐    ┌─────────┐
//!                       │   CLI   │    │  HTTP   │
//!                       │  (cqa)  │    │ server  │
//!                       └─────────┘    └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cqa init                          # write config, create store
//! cqa ingest ./docs                 # index documents
//! cqa search "refund policy"        # retrieval only
//! cqa ask "what is the refund policy?"
//! cqa serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`chunker`] | Parent/child document splitting |
//! | [`index`] | Two-tier chunk index over the stores |
//! | [`sparse`] | In-memory BM25 index |
//! | [`fusion`] | Hybrid retrieval with reciprocal rank fusion |
//! | [`rewrite`] | Query rewriting, expansion, and transformation |
//! | [`control`] | Retrieval-generation control loop |
//! | [`state`] | Loop state, turn events, suspend/resume protocol |
//! | [`gateway`] | Embedding, generation, rerank, and web-search providers |
//! | [`store`] | Vector and blob storage backends |
//! | [`app`] | Dependency wiring |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod chunker;
pub mod config;
pub mod control;
pub mod db;
pub mod fusion;
pub mod gateway;
pub mod index;
pub mod migrate;
pub mod models;
pub mod rewrite;
pub mod server;
pub mod sparse;
pub mod state;
pub mod store;
