//! Query rewriting, expansion, and transformation.
//!
//! Three concerns share the generator here:
//! - **rewrite**: make a follow-up question standalone using conversation
//!   history ("what about its pricing?" → "what is Acme's pricing?").
//! - **expand**: paraphrase a query into 2–4 variants for multi-query
//!   retrieval; the original is always among them.
//! - **transform**: produce a genuinely different query after a failed
//!   retrieval, rejecting variants that overlap the already-tried ones and
//!   falling back to deterministic templates when the model cannot help.
//!
//! Every path degrades to the unmodified input on model failure. Rewriting
//! improves retrieval; it must never block it.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::gateway::{Generator, Message};
use crate::models::ConversationTurn;

/// A history-disambiguated query plus what the model extracted from it.
#[derive(Debug, Clone, Deserialize)]
pub struct RewrittenQuery {
    pub standalone_query: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub confidence: f64,
}

impl RewrittenQuery {
    fn passthrough(query: &str) -> Self {
        Self {
            standalone_query: query.to_string(),
            entities: Vec::new(),
            intent: String::new(),
            confidence: 1.0,
        }
    }
}

/// Coarse query category driving the deterministic transform templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCategory {
    Product,
    Process,
    Comparison,
    General,
}

/// Keyword heuristic, deliberately crude. It only has to pick a template
/// family, not understand the question.
pub fn classify(query: &str) -> ContentCategory {
    let lower = query.to_lowercase();
    if ["how do", "how to", "steps", "process", "workflow", "setup"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        ContentCategory::Process
    } else if ["versus", " vs ", "compare", "difference", "better"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        ContentCategory::Comparison
    } else if ["price", "pricing", "feature", "product", "plan", "tier"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        ContentCategory::Product
    } else {
        ContentCategory::General
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "do", "does", "did", "what", "which", "who",
    "how", "can", "could", "would", "should", "i", "me", "my", "you", "your", "we", "it", "its",
    "of", "to", "in", "on", "for", "about", "tell", "please",
];

/// Content keywords of a query: tokens with common filler words removed.
fn keywords(query: &str) -> String {
    let kept: Vec<&str> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| !STOPWORDS.contains(&t.to_lowercase().as_str()))
        .collect();
    kept.join(" ")
}

/// Deterministic reformulations used when the model produces nothing new.
/// Built from content keywords so the variants actually diverge from the
/// question's original phrasing.
pub fn templated_variants(query: &str) -> Vec<String> {
    let stripped = keywords(query);
    let trimmed = if stripped.is_empty() {
        query.trim_end_matches(['?', '.', '!']).trim().to_string()
    } else {
        stripped
    };
    let trimmed = trimmed.as_str();
    match classify(query) {
        ContentCategory::Process => vec![
            format!("step by step guide: {}", trimmed),
            format!("{} instructions and requirements", trimmed),
            format!("what is needed for {}", trimmed),
        ],
        ContentCategory::Comparison => vec![
            format!("{} key differences", trimmed),
            format!("{} pros and cons", trimmed),
            format!("detailed comparison of {}", trimmed),
        ],
        ContentCategory::Product => vec![
            format!("{} details and specifications", trimmed),
            format!("overview of {}", trimmed),
            format!("{} documentation", trimmed),
        ],
        ContentCategory::General => vec![
            format!("information about {}", trimmed),
            format!("{} explained", trimmed),
            format!("background on {}", trimmed),
        ],
    }
}

fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Token Jaccard overlap in `[0, 1]`. Two empty strings overlap fully.
pub fn overlap_ratio(a: &str, b: &str) -> f64 {
    let sa = token_set(a);
    let sb = token_set(b);
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    intersection / union
}

/// Render recent conversation turns into a bounded plain-text summary block.
/// Keeps the last `max_turns` turns, newest last, truncated from the front
/// to fit `char_budget`.
pub fn summarize_history(
    turns: &[ConversationTurn],
    max_turns: usize,
    char_budget: usize,
) -> String {
    let recent = &turns[turns.len().saturating_sub(max_turns)..];
    let mut lines: Vec<String> = recent
        .iter()
        .map(|t| {
            let speaker = match t.role {
                crate::models::Role::User => "User",
                crate::models::Role::Assistant => "Assistant",
            };
            format!("{}: {}", speaker, t.content)
        })
        .collect();

    let mut total: usize = lines.iter().map(|l| l.len() + 1).sum();
    while total > char_budget && lines.len() > 1 {
        let dropped = lines.remove(0);
        total -= dropped.len() + 1;
    }
    if let Some(line) = lines.first_mut() {
        if line.len() > char_budget {
            let mut cut = char_budget;
            while cut > 0 && !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }
    }
    lines.join("\n")
}

const MAX_TRANSFORM_OVERLAP: f64 = 0.5;

pub struct QueryRewriter {
    generator: Arc<dyn Generator>,
}

impl QueryRewriter {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    /// Disambiguate a follow-up question against the conversation history.
    /// Self-contained questions come back unchanged; model failure degrades
    /// to the original query.
    pub async fn rewrite(&self, query: &str, history_summary: &str) -> RewrittenQuery {
        if history_summary.trim().is_empty() {
            return RewrittenQuery::passthrough(query);
        }

        let schema = serde_json::json!({
            "standalone_query": "the question rewritten to stand alone",
            "entities": ["entity"],
            "intent": "what the user wants",
            "confidence": 0.9
        });
        let messages = [
            Message::system(
                "Rewrite the latest question so it can be understood without the \
                 conversation. Resolve pronouns and references using the history. \
                 If the question is already self-contained, return it unchanged \
                 with confidence 1.0.",
            ),
            Message::user(format!(
                "Conversation:\n{}\n\nLatest question: {}",
                history_summary, query
            )),
        ];

        match self.generator.complete_structured(&messages, &schema).await {
            Ok(value) => match serde_json::from_value::<RewrittenQuery>(value) {
                Ok(rewritten) if !rewritten.standalone_query.trim().is_empty() => rewritten,
                _ => RewrittenQuery::passthrough(query),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Query rewrite failed, using original");
                RewrittenQuery::passthrough(query)
            }
        }
    }

    /// Paraphrase `query` into retrieval variants. The original is always
    /// first; at most four queries total.
    pub async fn expand(&self, query: &str) -> Vec<String> {
        let schema = serde_json::json!({ "queries": ["paraphrase"] });
        let messages = [
            Message::system(
                "Generate 2 to 3 alternative phrasings of the question for \
                 document retrieval. Vary the vocabulary, keep the meaning.",
            ),
            Message::user(query.to_string()),
        ];

        let mut out = vec![query.to_string()];
        if let Ok(value) = self.generator.complete_structured(&messages, &schema).await {
            if let Some(queries) = value.get("queries").and_then(|q| q.as_array()) {
                for q in queries {
                    if let Some(s) = q.as_str() {
                        let s = s.trim();
                        if !s.is_empty() && !out.iter().any(|existing| existing == s) {
                            out.push(s.to_string());
                        }
                    }
                    if out.len() >= 4 {
                        break;
                    }
                }
            }
        }
        out
    }

    /// Produce a retrieval query materially different from everything in
    /// `tried`. Model suggestions overlapping any tried query by more than
    /// half are rejected in favor of deterministic templates.
    pub async fn transform(&self, question: &str, tried: &[String]) -> String {
        let fresh = |candidate: &str| {
            !candidate.trim().is_empty()
                && tried
                    .iter()
                    .all(|t| overlap_ratio(candidate, t) <= MAX_TRANSFORM_OVERLAP)
        };

        let schema = serde_json::json!({ "query": "reformulated search query" });
        let messages = [
            Message::system(
                "The previous search queries found nothing relevant. Reformulate \
                 the question into a different search query: change vocabulary, \
                 add likely synonyms, drop filler words.",
            ),
            Message::user(format!(
                "Question: {}\nAlready tried: {}",
                question,
                tried.join("; ")
            )),
        ];

        if let Ok(value) = self.generator.complete_structured(&messages, &schema).await {
            if let Some(candidate) = value.get("query").and_then(|q| q.as_str()) {
                if fresh(candidate) {
                    return candidate.trim().to_string();
                }
                tracing::debug!("Model transform too close to tried queries, using template");
            }
        }

        for variant in templated_variants(question) {
            if fresh(&variant) {
                return variant;
            }
        }
        // Everything overlaps; retry the raw question rather than loop.
        question.to_string()
    }
}
