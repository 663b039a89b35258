//! In-memory BM25 index over child chunks.
//!
//! The index is rebuilt in full from the vector store after every ingest or
//! delete. Rebuild cost is linear in corpus size, which keeps the lexical
//! path trivially consistent with the dense path at an accepted latency
//! cost for large corpora.

use std::collections::HashMap;

use crate::models::{Chunk, MetadataFilter};

const K1: f64 = 1.2;
const B: f64 = 0.75;

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

struct IndexedDoc {
    chunk: Chunk,
    term_freq: HashMap<String, usize>,
    len: usize,
}

/// Okapi BM25 index (k1 = 1.2, b = 0.75).
#[derive(Default)]
pub struct SparseIndex {
    docs: Vec<IndexedDoc>,
    doc_freq: HashMap<String, usize>,
    avg_len: f64,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index with a fresh build over `chunks`.
    pub fn rebuild(&mut self, chunks: Vec<Chunk>) {
        let mut docs = Vec::with_capacity(chunks.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for chunk in chunks {
            let tokens = tokenize(&chunk.text);
            let mut term_freq: HashMap<String, usize> = HashMap::new();
            for token in &tokens {
                *term_freq.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_freq.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_len += tokens.len();
            docs.push(IndexedDoc {
                chunk,
                term_freq,
                len: tokens.len(),
            });
        }

        self.avg_len = if docs.is_empty() {
            0.0
        } else {
            total_len as f64 / docs.len() as f64
        };
        self.docs = docs;
        self.doc_freq = doc_freq;
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    fn score(&self, doc: &IndexedDoc, query_terms: &[String]) -> f64 {
        let n = self.docs.len() as f64;
        let mut score = 0.0;
        for term in query_terms {
            let tf = match doc.term_freq.get(term) {
                Some(&tf) => tf as f64,
                None => continue,
            };
            let df = *self.doc_freq.get(term).unwrap_or(&0) as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            let norm = K1 * (1.0 - B + B * doc.len as f64 / self.avg_len.max(1.0));
            score += idf * (tf * (K1 + 1.0)) / (tf + norm);
        }
        score
    }

    /// Top-`k` chunks by BM25 score, best first. Chunks with zero score are
    /// excluded; restricted to chunks matching `filter`.
    pub fn search(&self, query: &str, k: usize, filter: &MetadataFilter) -> Vec<(Chunk, f64)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(Chunk, f64)> = self
            .docs
            .iter()
            .filter(|doc| filter.matches(&doc.chunk.metadata))
            .map(|doc| (doc.chunk.clone(), self.score(doc, &query_terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}
