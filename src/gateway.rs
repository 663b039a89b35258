//! External collaborator contracts and implementations.
//!
//! The core consumes four narrow interfaces: [`Embedder`], [`Generator`],
//! [`Reranker`], and [`WebSearch`]. Reranking and web search are optional —
//! their absence is a valid configuration, not an error.
//!
//! Concrete providers:
//! - **[`HashEmbedder`]** — deterministic bag-of-words feature hashing; no
//!   network, suitable for offline use and tests.
//! - **[`OpenAiEmbedder`]** / **[`OpenAiGenerator`]** — any OpenAI-compatible
//!   endpoint, with batching, bounded timeout, and exponential backoff.
//! - **[`HttpReranker`]** — Cohere/Jina-style rerank endpoint.
//! - **[`TavilySearch`]** — Tavily web search API.
//!
//! # Retry Strategy
//!
//! Remote providers retry transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    Config, EmbeddingConfig, GeneratorConfig, RerankerConfig, WebSearchConfig,
};

/// Message role for generator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One message in a generator conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// A web search hit returned by a [`WebSearch`] provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

/// Text embedding collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;
}

/// Embed a single text. Convenience wrapper for query embedding.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embedder.embed(&[text.to_string()]).await?;
    vectors
        .pop()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Generative model collaborator. Used both for free-text answers and for
/// schema-constrained grading/classification calls.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Free-text completion.
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Completion constrained to a JSON object. The `schema_hint` is a small
    /// JSON example of the expected shape; providers append it to the prompt
    /// and request JSON output. Grading calls always pass an exact schema.
    async fn complete_structured(
        &self,
        messages: &[Message],
        schema_hint: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Cross-encoder-style relevance scorer. Optional quality enhancement — the
/// fusion engine treats a failure here as fully recoverable.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score `(query, text)` pairs; one score per text, higher = better.
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;
}

/// External web search collaborator.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<WebHit>>;
}

/// Bundle of collaborator handles, constructed once at process start and
/// passed into the engine and control-loop constructors. No hidden globals.
#[derive(Clone)]
pub struct Gateway {
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub web_search: Option<Arc<dyn WebSearch>>,
}

impl Gateway {
    /// Instantiate providers from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = match config.embedding.provider.as_str() {
            "hash" => Arc::new(HashEmbedder::new(config.embedding.dims)),
            "openai" => Arc::new(OpenAiEmbedder::new(&config.embedding)?),
            "disabled" => Arc::new(DisabledEmbedder),
            other => bail!("Unknown embedding provider: {}", other),
        };

        let generator: Arc<dyn Generator> = match config.generator.provider.as_str() {
            "openai" => Arc::new(OpenAiGenerator::new(&config.generator)?),
            "disabled" => Arc::new(DisabledGenerator),
            other => bail!("Unknown generator provider: {}", other),
        };

        let reranker: Option<Arc<dyn Reranker>> = match config.reranker.provider.as_str() {
            "http" => Some(Arc::new(HttpReranker::new(&config.reranker)?)),
            "disabled" => None,
            other => bail!("Unknown reranker provider: {}", other),
        };

        let web_search: Option<Arc<dyn WebSearch>> = match config.web_search.provider.as_str() {
            "tavily" => Some(Arc::new(TavilySearch::new(&config.web_search)?)),
            "disabled" => None,
            other => bail!("Unknown web search provider: {}", other),
        };

        Ok(Self {
            embedder,
            generator,
            reranker,
            web_search,
        })
    }
}

// ============ Vector blob codecs ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

// ============ Hash embedder ============

/// Deterministic feature-hashing embedder.
///
/// Tokenizes on non-alphanumeric boundaries, hashes each token into a bucket
/// with a sign bit, accumulates, and L2-normalizes. Texts sharing vocabulary
/// land close in cosine space, which is enough for offline development and
/// for exercising the dense retrieval path in tests.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&digest[..8]);
            let bucket = u64::from_le_bytes(prefix) as usize % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ Disabled providers ============

/// Embedder stand-in used when embeddings are not configured. Any call fails
/// with a descriptive error.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }

    fn dims(&self) -> usize {
        0
    }
}

/// Generator stand-in used when no model is configured. The control loop's
/// fail-open policies turn these errors into graded fallbacks, so a turn
/// still terminates with a degraded answer.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    async fn complete(&self, _messages: &[Message]) -> Result<String> {
        bail!("Generator provider is disabled")
    }

    async fn complete_structured(
        &self,
        _messages: &[Message],
        _schema_hint: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        bail!("Generator provider is disabled")
    }
}

// ============ Shared HTTP retry helper ============

async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1u64 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).header("Content-Type", "application/json");
        if let Some(key) = api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        match req.json(body).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error — retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("API error {}: {}", status, body_text));
                    continue;
                }

                // Client error (not 429) — don't retry
                let body_text = response.text().await.unwrap_or_default();
                bail!("API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Request failed after retries")))
}

fn require_api_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))
}

// ============ OpenAI-compatible embedder ============

/// Embedding provider for OpenAI-compatible `/embeddings` endpoints.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        require_api_key()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            base_url: config.base_url.clone(),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = require_api_key()?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let json =
            post_json_with_retry(&self.client, &url, Some(&api_key), &body, self.max_retries)
                .await?;

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;
            let vec: Vec<f32> = embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            embeddings.push(vec);
        }

        Ok(embeddings)
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ OpenAI-compatible generator ============

/// Chat-completion provider for OpenAI-compatible `/chat/completions`
/// endpoints (OpenAI, DeepSeek, local gateways).
pub struct OpenAiGenerator {
    model: String,
    base_url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generator.model required for OpenAI provider"))?;
        require_api_key()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            base_url: config.base_url.clone(),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn chat(&self, body: serde_json::Value) -> Result<String> {
        let api_key = require_api_key()?;
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let json =
            post_json_with_retry(&self.client, &url, Some(&api_key), &body, self.max_retries)
                .await?;

        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing message content"))
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        self.chat(body).await
    }

    async fn complete_structured(
        &self,
        messages: &[Message],
        schema_hint: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut messages = messages.to_vec();
        messages.push(Message::system(format!(
            "Respond with a single JSON object exactly matching this shape: {}",
            schema_hint
        )));

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "response_format": { "type": "json_object" },
        });

        let content = self.chat(body).await?;
        serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Structured output was not valid JSON: {}", e))
    }
}

// ============ HTTP reranker ============

/// Cross-encoder scorer backed by a Cohere/Jina-style rerank endpoint:
/// `POST url {model, query, documents}` returning
/// `{results: [{index, relevance_score}]}`.
pub struct HttpReranker {
    url: String,
    model: Option<String>,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("reranker.url required for HTTP provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            url,
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let api_key = std::env::var("RERANKER_API_KEY").ok();
        let mut body = serde_json::json!({
            "query": query,
            "documents": texts,
        });
        if let Some(ref model) = self.model {
            body["model"] = serde_json::json!(model);
        }

        let json =
            post_json_with_retry(&self.client, &self.url, api_key.as_deref(), &body, 1).await?;

        let results = json
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing results"))?;

        let mut scores = vec![0.0f32; texts.len()];
        for item in results {
            let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
            let score = item
                .get("relevance_score")
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0) as f32;
            if index < scores.len() {
                scores[index] = score;
            }
        }

        Ok(scores)
    }
}

// ============ Tavily web search ============

/// Web search provider backed by the Tavily API. Requires the
/// `TAVILY_API_KEY` environment variable.
pub struct TavilySearch {
    max_results: usize,
    client: reqwest::Client,
}

impl TavilySearch {
    pub fn new(config: &WebSearchConfig) -> Result<Self> {
        if std::env::var("TAVILY_API_KEY").is_err() {
            bail!("TAVILY_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            max_results: config.max_results,
            client,
        })
    }
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<WebHit>> {
        let api_key = std::env::var("TAVILY_API_KEY")
            .map_err(|_| anyhow::anyhow!("TAVILY_API_KEY not set"))?;

        let body = serde_json::json!({
            "api_key": api_key,
            "query": query,
            "max_results": self.max_results,
        });

        let json = post_json_with_retry(
            &self.client,
            "https://api.tavily.com/search",
            None,
            &body,
            1,
        )
        .await?;

        let results = json
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid search response: missing results"))?;

        Ok(results
            .iter()
            .map(|item| WebHit {
                title: item
                    .get("title")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                snippet: item
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string(),
                url: item
                    .get("url")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }
}
