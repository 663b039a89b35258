//! Control-loop state, grades, turn events, and the suspend/resume protocol.
//!
//! Everything a turn accumulates lives in one typed [`LoopState`]. Nodes
//! never mutate it directly; they return a [`NodeUpdate`] that the driver
//! merges, so every state transition is visible in one place. Grades are
//! closed enums — free-form model output is parsed into them at the model
//! boundary and nowhere else. Suspension is plain data: a serialized
//! [`SuspendedTurn`] can be parked in a map or a row and resumed later.

use serde::{Deserialize, Serialize};

use crate::gateway::WebHit;
use crate::models::{Chunk, MetadataFilter};

/// Document relevance grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    Yes,
    Partial,
    No,
}

impl Grade {
    /// Parse a model-produced grade string. Unknown values map to `Yes`:
    /// grading is advisory and the loop fails open.
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "no" => Grade::No,
            "partial" => Grade::Partial,
            _ => Grade::Yes,
        }
    }
}

/// Yes/no quality verdict (grounding, relevance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryGrade {
    Yes,
    No,
}

impl BinaryGrade {
    /// Unknown values map to `Yes` (fail-open).
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "no" => BinaryGrade::No,
            _ => BinaryGrade::Yes,
        }
    }
}

/// Caller's answer to a suspended human-approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "value", rename_all = "snake_case")]
pub enum ResumeSignal {
    /// Proceed to generation with the current material.
    Approved,
    /// Discard the material and retry with a transformed query.
    Rejected,
    /// Discard the material and go to web search instead.
    WebSearchRequested,
    /// An implicit rejection with guidance: retry with a transformed
    /// query, carrying the free-text feedback into the eventual generation.
    Feedback(String),
}

/// Nodes of the retrieval-generation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Retrieve,
    GradeDocuments,
    TransformQuery,
    WebSearch,
    HumanApproval,
    Generate,
    CheckQuality,
    Done,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::Retrieve => "retrieve",
            Node::GradeDocuments => "grade_documents",
            Node::TransformQuery => "transform_query",
            Node::WebSearch => "web_search",
            Node::HumanApproval => "human_approval",
            Node::Generate => "generate",
            Node::CheckQuality => "check_quality",
            Node::Done => "done",
        }
    }
}

/// Accumulated state of one question-answering turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    /// The user's question, verbatim.
    pub question: String,
    /// The query currently used for retrieval; starts as the (rewritten)
    /// question and changes on every transform.
    pub search_query: String,
    pub history_summary: String,
    /// Caller-supplied preference rules injected into generation.
    #[serde(default)]
    pub preferences: Option<String>,
    #[serde(default)]
    pub filter: MetadataFilter,
    pub top_k: usize,
    /// Knowledge-base material retrieved so far.
    #[serde(default)]
    pub kb_docs: Vec<Chunk>,
    /// Web material retrieved so far.
    #[serde(default)]
    pub web_docs: Vec<WebHit>,
    #[serde(default)]
    pub grade: Option<Grade>,
    /// Every query that has been sent to retrieval this turn.
    #[serde(default)]
    pub tried_queries: Vec<String>,
    /// Shared budget across transform and web-search transitions.
    #[serde(default)]
    pub retry_count: u32,
    /// Caller asked for web search up front.
    #[serde(default)]
    pub force_web_search: bool,
    /// Web-only turn: the local index had nothing to contribute.
    #[serde(default)]
    pub pure_web: bool,
    #[serde(default)]
    pub human_feedback: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub grounded: Option<BinaryGrade>,
    #[serde(default)]
    pub relevant: Option<BinaryGrade>,
}

impl LoopState {
    pub fn has_material(&self) -> bool {
        !self.kb_docs.is_empty() || !self.web_docs.is_empty()
    }
}

/// Partial state produced by one node execution. `Default` is a no-op
/// update; the driver merges whatever is set.
#[derive(Debug, Default)]
pub struct NodeUpdate {
    pub search_query: Option<String>,
    pub kb_docs: Option<Vec<Chunk>>,
    pub web_docs: Option<Vec<WebHit>>,
    pub grade: Option<Grade>,
    /// Query to append to `tried_queries`.
    pub tried_query: Option<String>,
    pub retry_increment: u32,
    pub pure_web: Option<bool>,
    /// `Some(None)` clears previously recorded feedback.
    pub human_feedback: Option<Option<String>>,
    pub answer: Option<String>,
    pub grounded: Option<BinaryGrade>,
    pub relevant: Option<BinaryGrade>,
}

impl NodeUpdate {
    pub fn apply(self, state: &mut LoopState) {
        if let Some(q) = self.search_query {
            state.search_query = q;
        }
        if let Some(docs) = self.kb_docs {
            state.kb_docs = docs;
        }
        if let Some(docs) = self.web_docs {
            state.web_docs = docs;
        }
        if let Some(grade) = self.grade {
            state.grade = Some(grade);
        }
        if let Some(tried) = self.tried_query {
            if !state.tried_queries.contains(&tried) {
                state.tried_queries.push(tried);
            }
        }
        state.retry_count += self.retry_increment;
        if let Some(pure_web) = self.pure_web {
            state.pure_web = pure_web;
        }
        if let Some(feedback) = self.human_feedback {
            state.human_feedback = feedback;
        }
        if let Some(answer) = self.answer {
            state.answer = Some(answer);
        }
        if let Some(grounded) = self.grounded {
            state.grounded = Some(grounded);
        }
        if let Some(relevant) = self.relevant {
            state.relevant = Some(relevant);
        }
    }
}

/// What a human reviewer sees when a turn suspends for approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewContext {
    pub turn_id: String,
    pub question: String,
    pub search_query: String,
    /// First line of each candidate passage.
    pub doc_previews: Vec<String>,
    pub retry_count: u32,
}

/// Events streamed to the caller while a turn runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The loop entered a node.
    Status { node: String },
    /// A piece of the final answer.
    Token { content: String },
    /// The turn suspended awaiting a [`ResumeSignal`].
    Interrupt { context: ReviewContext },
    /// The turn is over.
    Done,
}

/// A turn parked at the human-approval gate: the full loop state plus where
/// to continue. Plain serializable data — persist it anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedTurn {
    pub turn_id: String,
    pub state: LoopState,
    pub resume_node: Node,
    pub suspended_at: chrono::DateTime<chrono::Utc>,
}

impl SuspendedTurn {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Sending side of the turn event stream. Dropped receivers are fine — a
/// disconnected caller must not abort the turn.
#[derive(Clone)]
pub struct EventSink {
    tx: tokio::sync::mpsc::UnboundedSender<TurnEvent>,
}

impl EventSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<TurnEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink that drops everything, for callers that don't stream.
    pub fn discard() -> Self {
        let (sink, _rx) = Self::new();
        sink
    }

    pub fn status(&self, node: Node) {
        let _ = self.tx.send(TurnEvent::Status {
            node: node.name().to_string(),
        });
    }

    pub fn token(&self, content: impl Into<String>) {
        let _ = self.tx.send(TurnEvent::Token {
            content: content.into(),
        });
    }

    pub fn interrupt(&self, context: ReviewContext) {
        let _ = self.tx.send(TurnEvent::Interrupt { context });
    }

    pub fn done(&self) {
        let _ = self.tx.send(TurnEvent::Done);
    }
}
