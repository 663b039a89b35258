use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    pub path: Option<PathBuf>,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Parent splitting strategy: `fixed` (size boundaries) or `semantic`
    /// (embedding-similarity breakpoints).
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Two-tier mode. When false, a single tier of parent-sized chunks is
    /// indexed directly and returned as-is.
    #[serde(default = "default_parent_child")]
    pub parent_child: bool,
    #[serde(default = "default_parent_chars")]
    pub parent_chars: usize,
    #[serde(default = "default_parent_overlap")]
    pub parent_overlap: usize,
    #[serde(default = "default_child_chars")]
    pub child_chars: usize,
    #[serde(default = "default_child_overlap")]
    pub child_overlap: usize,
    /// Minimum parent/child size ratio enforced at startup.
    #[serde(default = "default_min_parent_ratio")]
    pub min_parent_ratio: usize,
    /// Similarity percentile (0-100) below which a semantic breakpoint is
    /// inserted between sentences. Only used by the `semantic` strategy.
    #[serde(default = "default_semantic_percentile")]
    pub semantic_percentile: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            parent_child: default_parent_child(),
            parent_chars: default_parent_chars(),
            parent_overlap: default_parent_overlap(),
            child_chars: default_child_chars(),
            child_overlap: default_child_overlap(),
            min_parent_ratio: default_min_parent_ratio(),
            semantic_percentile: default_semantic_percentile(),
        }
    }
}

fn default_strategy() -> String {
    "fixed".to_string()
}
fn default_parent_child() -> bool {
    true
}
fn default_parent_chars() -> usize {
    2000
}
fn default_parent_overlap() -> usize {
    200
}
fn default_child_chars() -> usize {
    400
}
fn default_child_overlap() -> usize {
    80
}
fn default_min_parent_ratio() -> usize {
    3
}
fn default_semantic_percentile() -> f64 {
    85.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Final result count per query when the caller does not override it.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Cap on how many fused candidates are handed to the cross-encoder.
    #[serde(default = "default_rerank_max_candidates")]
    pub rerank_max_candidates: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank_max_candidates: default_rerank_max_candidates(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_rerank_max_candidates() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash` (deterministic, offline), `openai`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    /// `openai` (any OpenAI-compatible chat endpoint) or `disabled`.
    #[serde(default = "default_generator_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_generator_provider(),
            model: None,
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_generator_timeout(),
        }
    }
}

fn default_generator_provider() -> String {
    "disabled".to_string()
}
fn default_generator_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `http` (Cohere/Jina-style rerank endpoint) or `disabled`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchConfig {
    /// `tavily` or `disabled`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_web_max_results")]
    pub max_results: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            max_results: default_web_max_results(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_web_max_results() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Overall retry budget shared across query-transform and web-search
    /// transitions; exceeding it forces generation.
    #[serde(default = "default_loop_max_retries")]
    pub max_retries: u32,
    /// Retry count at which a `no` grade escalates straight to web search.
    #[serde(default = "default_escalation_retries")]
    pub max_retries_before_escalation: u32,
    /// Whether generation waits on a human approval gate.
    #[serde(default)]
    pub human_approval: bool,
    /// Retry count after which the approval gate auto-approves.
    #[serde(default = "default_auto_approve_after")]
    pub auto_approve_after: u32,
    /// How many recent conversation turns feed the history summary.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Character budget for the history summary (~2000 tokens).
    #[serde(default = "default_history_char_budget")]
    pub history_char_budget: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_retries: default_loop_max_retries(),
            max_retries_before_escalation: default_escalation_retries(),
            human_approval: false,
            auto_approve_after: default_auto_approve_after(),
            history_turns: default_history_turns(),
            history_char_budget: default_history_char_budget(),
        }
    }
}

fn default_loop_max_retries() -> u32 {
    3
}
fn default_escalation_retries() -> u32 {
    2
}
fn default_auto_approve_after() -> u32 {
    3
}
fn default_history_turns() -> usize {
    3
}
fn default_history_char_budget() -> usize {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Configuration invariants are enforced here, at startup — a violating
/// configuration is fatal before any request is served.
pub fn validate(config: &Config) -> Result<()> {
    match config.store.backend.as_str() {
        "sqlite" => {
            if config.store.path.is_none() {
                anyhow::bail!("store.path is required when store.backend is 'sqlite'");
            }
        }
        "memory" => {}
        other => anyhow::bail!("Unknown store backend: '{}'. Use sqlite or memory.", other),
    }

    let c = &config.chunking;
    match c.strategy.as_str() {
        "fixed" | "semantic" => {}
        other => anyhow::bail!(
            "Unknown chunking strategy: '{}'. Use fixed or semantic.",
            other
        ),
    }
    if c.parent_chars == 0 || c.child_chars == 0 {
        anyhow::bail!("chunking.parent_chars and chunking.child_chars must be > 0");
    }
    if c.parent_child {
        if c.child_chars >= c.parent_chars {
            anyhow::bail!(
                "chunking.child_chars ({}) must be strictly smaller than parent_chars ({})",
                c.child_chars,
                c.parent_chars
            );
        }
        if c.parent_chars < c.child_chars * c.min_parent_ratio {
            anyhow::bail!(
                "chunking.parent_chars ({}) must be at least {}x child_chars ({})",
                c.parent_chars,
                c.min_parent_ratio,
                c.child_chars
            );
        }
    }
    if c.child_overlap >= c.child_chars {
        anyhow::bail!("chunking.child_overlap must be smaller than child_chars");
    }
    if c.parent_overlap >= c.parent_chars {
        anyhow::bail!("chunking.parent_overlap must be smaller than parent_chars");
    }
    if !(0.0..=100.0).contains(&c.semantic_percentile) {
        anyhow::bail!("chunking.semantic_percentile must be in [0, 100]");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "hash" | "openai" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Use hash, openai, or disabled.",
            other
        ),
    }
    if config.embedding.provider != "disabled" && config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model is required when embedding.provider is 'openai'");
    }

    match config.generator.provider.as_str() {
        "openai" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown generator provider: '{}'. Use openai or disabled.",
            other
        ),
    }
    if config.generator.provider == "openai" && config.generator.model.is_none() {
        anyhow::bail!("generator.model is required when generator.provider is 'openai'");
    }

    match config.reranker.provider.as_str() {
        "http" => {
            if config.reranker.url.is_none() {
                anyhow::bail!("reranker.url is required when reranker.provider is 'http'");
            }
        }
        "disabled" => {}
        other => anyhow::bail!(
            "Unknown reranker provider: '{}'. Use http or disabled.",
            other
        ),
    }

    match config.web_search.provider.as_str() {
        "tavily" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown web search provider: '{}'. Use tavily or disabled.",
            other
        ),
    }

    let ctl = &config.control;
    if ctl.max_retries_before_escalation > ctl.max_retries {
        anyhow::bail!(
            "control.max_retries_before_escalation ({}) must not exceed control.max_retries ({})",
            ctl.max_retries_before_escalation,
            ctl.max_retries
        );
    }

    Ok(())
}

impl Config {
    /// Minimal in-memory configuration, used by tests and embedded callers.
    pub fn minimal() -> Self {
        Self {
            store: StoreConfig {
                backend: "memory".to_string(),
                path: None,
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            generator: GeneratorConfig::default(),
            reranker: RerankerConfig::default(),
            web_search: WebSearchConfig::default(),
            control: ControlConfig::default(),
            server: ServerConfig::default(),
        }
    }
}
