//! Adaptive retrieval-generation control loop.
//!
//! A turn walks the state machine
//! `Retrieve → GradeDocuments → {Generate | TransformQuery | WebSearch |
//! HumanApproval} → Generate → CheckQuality → {done | TransformQuery}`,
//! driven by [`ControlLoop::run_turn`]. Every node reads the current
//! [`LoopState`], returns a [`NodeUpdate`] and the next node, and the driver
//! merges the update — no node touches state behind the driver's back.
//!
//! Error posture: model failures in grading and quality checks default to
//! an accepting verdict, a web-search failure falls through to generation
//! with what is on hand, and a generation failure produces a scope-limited
//! fallback answer. The only hard errors a turn can surface are retrieval
//! infrastructure failures (store or embedder down).

use anyhow::Result;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ControlConfig;
use crate::fusion::{rrf_fuse, RetrievalFusionEngine};
use crate::gateway::{Generator, Message, WebSearch};
use crate::models::{Chunk, ConversationTurn, MetadataFilter};
use crate::rewrite::{summarize_history, QueryRewriter};
use crate::state::{
    BinaryGrade, EventSink, Grade, LoopState, Node, NodeUpdate, ResumeSignal, ReviewContext,
    SuspendedTurn,
};

/// One question from a caller, with everything the loop may use to answer it.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub question: String,
    pub history: Vec<ConversationTurn>,
    /// Standing preference rules applied to the generation prompt.
    pub preferences: Option<String>,
    pub filter: MetadataFilter,
    /// Overrides the configured retrieval `top_k` when set.
    pub top_k: Option<usize>,
    /// Caller explicitly wants web results for this turn.
    pub force_web_search: bool,
    /// Caller-chosen id; generated when absent.
    pub turn_id: Option<String>,
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    Complete { answer: String, state: LoopState },
    Suspended(SuspendedTurn),
}

pub struct ControlLoop {
    engine: Arc<RetrievalFusionEngine>,
    rewriter: QueryRewriter,
    generator: Arc<dyn Generator>,
    web_search: Option<Arc<dyn WebSearch>>,
    config: ControlConfig,
    default_top_k: usize,
}

impl ControlLoop {
    pub fn new(
        engine: Arc<RetrievalFusionEngine>,
        generator: Arc<dyn Generator>,
        web_search: Option<Arc<dyn WebSearch>>,
        config: ControlConfig,
        default_top_k: usize,
    ) -> Self {
        Self {
            engine,
            rewriter: QueryRewriter::new(generator.clone()),
            generator,
            web_search,
            config,
            default_top_k,
        }
    }

    /// Run one turn to completion or suspension, streaming progress into
    /// `events`.
    pub async fn run_turn(&self, request: TurnRequest, events: &EventSink) -> Result<TurnOutcome> {
        let turn_id = request
            .turn_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let history_summary = summarize_history(
            &request.history,
            self.config.history_turns,
            self.config.history_char_budget,
        );
        let rewritten = self
            .rewriter
            .rewrite(&request.question, &history_summary)
            .await;

        let state = LoopState {
            question: request.question,
            search_query: rewritten.standalone_query,
            history_summary,
            preferences: request.preferences,
            filter: request.filter,
            top_k: request.top_k.unwrap_or(self.default_top_k),
            kb_docs: Vec::new(),
            web_docs: Vec::new(),
            grade: None,
            tried_queries: Vec::new(),
            retry_count: 0,
            force_web_search: request.force_web_search,
            pure_web: false,
            human_feedback: None,
            answer: None,
            grounded: None,
            relevant: None,
        };

        self.drive(turn_id, state, Node::Retrieve, events).await
    }

    /// Continue a suspended turn with the reviewer's decision.
    pub async fn resume(
        &self,
        suspended: SuspendedTurn,
        signal: ResumeSignal,
        events: &EventSink,
    ) -> Result<TurnOutcome> {
        let SuspendedTurn {
            turn_id, mut state, ..
        } = suspended;

        let next = match signal {
            ResumeSignal::Approved => Node::Generate,
            // Feedback is an implicit rejection: the guidance is kept for
            // the eventual generation, but the material is retried first.
            // TransformQuery itself charges the retry budget.
            ResumeSignal::Feedback(text) => {
                state.human_feedback = Some(text);
                Node::TransformQuery
            }
            ResumeSignal::Rejected => Node::TransformQuery,
            ResumeSignal::WebSearchRequested => Node::WebSearch,
        };

        self.drive(turn_id, state, next, events).await
    }

    async fn drive(
        &self,
        turn_id: String,
        mut state: LoopState,
        mut node: Node,
        events: &EventSink,
    ) -> Result<TurnOutcome> {
        loop {
            events.status(node);
            let step = match node {
                Node::Retrieve => self.retrieve(&state).await?,
                Node::GradeDocuments => self.grade_documents(&state).await,
                Node::TransformQuery => self.transform_query(&state).await,
                Node::WebSearch => self.search_web(&state).await,
                Node::HumanApproval => match self.human_approval(&turn_id, &state, events) {
                    Some(step) => step,
                    None => {
                        return Ok(TurnOutcome::Suspended(SuspendedTurn {
                            turn_id,
                            state,
                            resume_node: Node::HumanApproval,
                            suspended_at: chrono::Utc::now(),
                        }))
                    }
                },
                Node::Generate => self.generate(&state, events).await,
                Node::CheckQuality => self.check_quality(&state).await,
                Node::Done => {
                    events.done();
                    let answer = state.answer.clone().unwrap_or_default();
                    return Ok(TurnOutcome::Complete { answer, state });
                }
            };
            step.update.apply(&mut state);
            node = step.next;
        }
    }

    // ---- nodes ----

    async fn retrieve(&self, state: &LoopState) -> Result<Step> {
        // The first pass widens retrieval with paraphrase variants; retries
        // run their transformed query alone.
        let docs = if state.retry_count == 0 {
            let variants = self.rewriter.expand(&state.search_query).await;
            self.retrieve_variants(&variants, state.top_k, &state.filter)
                .await?
        } else {
            self.engine
                .retrieve(&state.search_query, state.top_k, &state.filter)
                .await?
        };

        let update = NodeUpdate {
            kb_docs: Some(docs.clone()),
            tried_query: Some(state.search_query.clone()),
            ..Default::default()
        };

        // The caller asked for the web outright: probe the local index to
        // decide between a pure-web turn and a hybrid one, skipping grading.
        if state.force_web_search && state.retry_count == 0 {
            let mut update = update;
            if docs.is_empty() {
                update.pure_web = Some(true);
            } else {
                update.grade = Some(Grade::Partial);
            }
            return Ok(Step::new(update, Node::WebSearch));
        }

        Ok(Step::new(update, Node::GradeDocuments))
    }

    /// Retrieve each query variant separately and fuse the ranked lists, so
    /// material that several phrasings agree on rises to the top. A single
    /// variant reduces to plain retrieval.
    async fn retrieve_variants(
        &self,
        queries: &[String],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Chunk>> {
        let mut lists = Vec::with_capacity(queries.len());
        for query in queries {
            let keyed: Vec<(String, Chunk)> = self
                .engine
                .retrieve(query, k, filter)
                .await?
                .into_iter()
                .map(|chunk| (chunk.dedup_key(), chunk))
                .collect();
            lists.push(keyed);
        }
        Ok(rrf_fuse(&lists)
            .into_iter()
            .map(|fused| fused.chunk)
            .take(k)
            .collect())
    }

    async fn grade_documents(&self, state: &LoopState) -> Step {
        let grade = if state.kb_docs.is_empty() {
            Grade::No
        } else {
            self.grade_relevance_of_docs(state).await
        };

        let next = match grade {
            Grade::Yes => Node::HumanApproval,
            Grade::Partial => {
                if self.web_search.is_some() {
                    Node::WebSearch
                } else {
                    Node::HumanApproval
                }
            }
            Grade::No => self.route_after_failure(state.retry_count),
        };

        Step::new(
            NodeUpdate {
                grade: Some(grade),
                ..Default::default()
            },
            next,
        )
    }

    /// Where a failed retrieval goes, given the shared retry budget:
    /// transform while cheap retries remain, escalate to the web, and at the
    /// limit stop retrying and answer with whatever exists.
    fn route_after_failure(&self, retry_count: u32) -> Node {
        if retry_count >= self.config.max_retries {
            Node::Generate
        } else if retry_count >= self.config.max_retries_before_escalation
            && self.web_search.is_some()
        {
            Node::WebSearch
        } else {
            Node::TransformQuery
        }
    }

    async fn transform_query(&self, state: &LoopState) -> Step {
        let new_query = self
            .rewriter
            .transform(&state.question, &state.tried_queries)
            .await;

        Step::new(
            NodeUpdate {
                search_query: Some(new_query.clone()),
                tried_query: Some(new_query),
                retry_increment: 1,
                ..Default::default()
            },
            Node::Retrieve,
        )
    }

    async fn search_web(&self, state: &LoopState) -> Step {
        let provider = match &self.web_search {
            Some(p) => p,
            None => {
                tracing::warn!("Web search requested but no provider configured");
                return Step::new(
                    NodeUpdate {
                        grade: Some(Grade::Yes),
                        ..Default::default()
                    },
                    Node::Generate,
                );
            }
        };

        match provider.search(&state.search_query).await {
            // Search results are terminal evidence: whatever the local
            // grade was, the merged material is now considered sufficient.
            Ok(hits) if !hits.is_empty() => Step::new(
                NodeUpdate {
                    web_docs: Some(hits),
                    grade: Some(Grade::Yes),
                    ..Default::default()
                },
                Node::HumanApproval,
            ),
            Ok(_) => {
                tracing::info!("Web search returned no results");
                Step::new(
                    NodeUpdate {
                        grade: Some(Grade::Yes),
                        ..Default::default()
                    },
                    Node::Generate,
                )
            }
            Err(e) => {
                // Degrade to generating from local material only.
                tracing::warn!(error = %e, "Web search failed, generating without it");
                Step::new(
                    NodeUpdate {
                        grade: Some(Grade::Yes),
                        ..Default::default()
                    },
                    Node::Generate,
                )
            }
        }
    }

    /// `Some(step)` continues the loop; `None` suspends the turn. The gate
    /// is transparent when approval is disabled and opens automatically
    /// once the retry budget shows the loop is struggling.
    fn human_approval(&self, turn_id: &str, state: &LoopState, events: &EventSink) -> Option<Step> {
        if !self.config.human_approval {
            return Some(Step::new(NodeUpdate::default(), Node::Generate));
        }
        if state.retry_count >= self.config.auto_approve_after {
            tracing::info!(
                retry_count = state.retry_count,
                "Auto-approving after repeated retries"
            );
            return Some(Step::new(NodeUpdate::default(), Node::Generate));
        }

        let doc_previews = state
            .kb_docs
            .iter()
            .map(|c| preview(&c.text))
            .chain(state.web_docs.iter().map(|h| format!("{} ({})", h.title, h.url)))
            .collect();
        events.interrupt(ReviewContext {
            turn_id: turn_id.to_string(),
            question: state.question.clone(),
            search_query: state.search_query.clone(),
            doc_previews,
            retry_count: state.retry_count,
        });
        None
    }

    async fn generate(&self, state: &LoopState, events: &EventSink) -> Step {
        let answer = if state.has_material() {
            let context = format_context(state);
            let mut system = String::from(
                "Answer the question using only the sources below. Cite sources \
                 as [Source N]. If the sources do not cover the question, say so \
                 rather than guessing.",
            );
            if let Some(prefs) = &state.preferences {
                system.push_str("\n\nFollow these user preferences:\n");
                system.push_str(prefs);
            }
            if let Some(feedback) = &state.human_feedback {
                system.push_str("\n\nReviewer feedback to incorporate:\n");
                system.push_str(feedback);
            }

            let messages = [
                Message::system(system),
                Message::user(format!(
                    "Sources:\n{}\n\nQuestion: {}",
                    context, state.question
                )),
            ];

            match self.generator.complete(&messages).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Generation failed, returning fallback answer");
                    fallback_answer(&state.question)
                }
            }
        } else {
            // Every escalation came back empty; admit it instead of inventing.
            fallback_answer(&state.question)
        };

        events.token(answer.clone());
        Step::new(
            NodeUpdate {
                answer: Some(answer),
                ..Default::default()
            },
            Node::CheckQuality,
        )
    }

    async fn check_quality(&self, state: &LoopState) -> Step {
        // Nothing to be grounded in — the fallback answer is accepted as-is.
        if !state.has_material() {
            return Step::new(
                NodeUpdate {
                    grounded: Some(BinaryGrade::Yes),
                    relevant: Some(BinaryGrade::Yes),
                    ..Default::default()
                },
                Node::Done,
            );
        }

        let answer = state.answer.as_deref().unwrap_or_default();
        let context = format_context(state);

        let grounded = self
            .binary_check(
                "Is the answer supported by the sources? Answer strictly yes or no.",
                &format!("Sources:\n{}\n\nAnswer:\n{}", context, answer),
            )
            .await;

        if grounded == BinaryGrade::No {
            // An ungrounded answer cannot be relevant; don't bother asking.
            let next = if state.retry_count >= self.config.max_retries {
                Node::Done
            } else {
                Node::TransformQuery
            };
            return Step::new(
                NodeUpdate {
                    grounded: Some(BinaryGrade::No),
                    relevant: Some(BinaryGrade::No),
                    ..Default::default()
                },
                next,
            );
        }

        let relevant = self
            .binary_check(
                "Does the answer address the question? Answer strictly yes or no.",
                &format!("Question:\n{}\n\nAnswer:\n{}", state.question, answer),
            )
            .await;

        let next = if relevant == BinaryGrade::Yes || state.retry_count >= self.config.max_retries {
            Node::Done
        } else {
            Node::TransformQuery
        };

        Step::new(
            NodeUpdate {
                grounded: Some(BinaryGrade::Yes),
                relevant: Some(relevant),
                ..Default::default()
            },
            next,
        )
    }

    // ---- model calls ----

    async fn grade_relevance_of_docs(&self, state: &LoopState) -> Grade {
        let docs: String = state
            .kb_docs
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] {}\n", i + 1, preview(&c.text)))
            .collect();

        let schema = serde_json::json!({ "score": "yes | partial | no" });
        let messages = [
            Message::system(
                "Grade whether the retrieved documents are relevant to the \
                 question. Answer yes if they cover it, partial if they cover \
                 only part of it, no if they are off-topic.",
            ),
            Message::user(format!(
                "Question: {}\n\nDocuments:\n{}",
                state.question, docs
            )),
        ];

        match self.generator.complete_structured(&messages, &schema).await {
            Ok(value) => {
                let raw = value.get("score").and_then(|s| s.as_str()).unwrap_or("yes");
                Grade::from_wire(raw)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Document grading failed, assuming relevant");
                Grade::Yes
            }
        }
    }

    async fn binary_check(&self, instruction: &str, body: &str) -> BinaryGrade {
        let schema = serde_json::json!({ "score": "yes | no" });
        let messages = [
            Message::system(instruction.to_string()),
            Message::user(body.to_string()),
        ];

        match self.generator.complete_structured(&messages, &schema).await {
            Ok(value) => {
                let raw = value.get("score").and_then(|s| s.as_str()).unwrap_or("yes");
                BinaryGrade::from_wire(raw)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Quality check failed, accepting answer");
                BinaryGrade::Yes
            }
        }
    }
}

struct Step {
    update: NodeUpdate,
    next: Node,
}

impl Step {
    fn new(update: NodeUpdate, next: Node) -> Self {
        Self { update, next }
    }
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.len() > 160 {
        let mut cut = 160;
        while cut > 0 && !line.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &line[..cut])
    } else {
        line.to_string()
    }
}

/// Render retrieved material as numbered source blocks for the generator.
fn format_context(state: &LoopState) -> String {
    let mut blocks = Vec::new();
    let mut n = 1;
    for chunk in &state.kb_docs {
        blocks.push(format!(
            "[Source {}] (file: {})\n{}",
            n, chunk.metadata.source_file, chunk.text
        ));
        n += 1;
    }
    for hit in &state.web_docs {
        blocks.push(format!(
            "[Source {}] (web: {})\n{}\n{}",
            n, hit.url, hit.title, hit.snippet
        ));
        n += 1;
    }
    blocks.join("\n\n")
}

/// The answer of last resort: honest, scoped, and free of invention.
fn fallback_answer(question: &str) -> String {
    format!(
        "I could not find reliable information to answer \"{}\". The indexed \
         documents do not appear to cover this topic. Try rephrasing the \
         question or ingesting documents that address it.",
        question.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, ControlConfig};
    use crate::gateway::{HashEmbedder, WebHit};
    use crate::index::ChunkIndex;
    use crate::models::ChunkMetadata;
    use crate::store::memory::{MemoryBlobStore, MemoryVectorStore};
    use crate::state::TurnEvent;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Generator that replays scripted structured replies in order and a
    /// fixed free-text answer. An empty script errors (model offline).
    struct ScriptedGenerator {
        structured: Mutex<VecDeque<serde_json::Value>>,
        answer: Option<String>,
    }

    impl ScriptedGenerator {
        fn new(structured: Vec<serde_json::Value>, answer: Option<&str>) -> Arc<Self> {
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

    struct StubWebSearch {
        hits: Vec<WebHit>,
    }

    #[async_trait]
    impl WebSearch for StubWebSearch {
        async fn search(&self, _query: &str) -> Result<Vec<WebHit>> {
            Ok(self.hits.clone())
        }
    }

    async fn seeded_engine() -> Arc<RetrievalFusionEngine> {
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
        index
            .ingest(
                "The starter plan costs ten dollars per month and includes \
                 one project. The team plan costs forty dollars per month.",
                ChunkMetadata {
                    source_file: "pricing.md".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        Arc::new(RetrievalFusionEngine::new(index, None, 100))
    }

    fn control(
        engine: Arc<RetrievalFusionEngine>,
        generator: Arc<dyn Generator>,
        web: Option<Arc<dyn WebSearch>>,
        config: ControlConfig,
    ) -> ControlLoop {
        ControlLoop::new(engine, generator, web, config, 4)
    }

    fn request(question: &str) -> TurnRequest {
        TurnRequest {
            question: question.to_string(),
            ..Default::default()
        }
    }

    fn statuses(events: &[TurnEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Status { node } => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    async fn collect(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<TurnEvent>,
    ) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_happy_path_yes_grade() {
        // Expansion (no variants), grade yes, grounded yes, relevant yes.
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("The starter plan costs $10/month [Source 1]."),
        );
        let ctl = control(seeded_engine().await, generator, None, ControlConfig::default());

        let (sink, rx) = EventSink::new();
        let outcome = ctl
            .run_turn(request("how much is the starter plan"), &sink)
            .await
            .unwrap();

        match outcome {
            TurnOutcome::Complete { answer, state } => {
                assert!(answer.contains("starter plan"));
                assert_eq!(state.grade, Some(Grade::Yes));
                assert_eq!(state.grounded, Some(BinaryGrade::Yes));
                assert_eq!(state.relevant, Some(BinaryGrade::Yes));
                assert_eq!(state.retry_count, 0);
                assert!(!state.kb_docs.is_empty());
            }
            other => panic!("expected completion, got {:?}", other),
        }

        let events = collect(rx).await;
        let nodes = statuses(&events);
        assert_eq!(
            nodes,
            ["retrieve", "grade_documents", "human_approval", "generate", "check_quality", "done"]
        );
        assert!(matches!(events.last(), Some(TurnEvent::Done)));
    }

    #[tokio::test]
    async fn test_partial_grade_escalates_to_web_and_merges() {
        // rewrite skipped (no history). Script: expansion, grade partial,
        // grounded yes, relevant yes.
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "partial" }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("Combined answer from local and web sources."),
        );
        let web = Arc::new(StubWebSearch {
            hits: vec![WebHit {
                title: "Plan comparison".to_string(),
                snippet: "Competitor plans cost more.".to_string(),
                url: "https://example.com/plans".to_string(),
            }],
        });
        let ctl = control(
            seeded_engine().await,
            generator,
            Some(web),
            ControlConfig::default(),
        );

        let (sink, rx) = EventSink::new();
        let outcome = ctl
            .run_turn(request("how do our plan prices compare"), &sink)
            .await
            .unwrap();

        match outcome {
            TurnOutcome::Complete { state, .. } => {
                // Successful search upgrades the partial grade.
                assert_eq!(state.grade, Some(Grade::Yes));
                assert!(!state.kb_docs.is_empty(), "local material was dropped");
                assert_eq!(state.web_docs.len(), 1, "web material missing");
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(statuses(&collect(rx).await).contains(&"web_search".to_string()));
    }

    #[tokio::test]
    async fn test_no_grade_transforms_and_retries() {
        // First grade: no → transform → retry. Second grade: yes. Then
        // grounded yes, relevant yes. The transform model call errors
        // (script exhausted mid-way is avoided by scripting it).
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "no" }),
                serde_json::json!({ "query": "monthly subscription cost breakdown" }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("It costs ten dollars."),
        );
        let ctl = control(seeded_engine().await, generator, None, ControlConfig::default());

        let (sink, rx) = EventSink::new();
        let outcome = ctl.run_turn(request("starter plan price"), &sink).await.unwrap();

        match outcome {
            TurnOutcome::Complete { state, .. } => {
                assert_eq!(state.retry_count, 1);
                assert_eq!(state.tried_queries.len(), 2);
                assert_ne!(state.tried_queries[0], state.tried_queries[1]);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        let nodes = statuses(&collect(rx).await);
        assert_eq!(nodes.iter().filter(|n| *n == "retrieve").count(), 2);
        assert!(nodes.contains(&"transform_query".to_string()));
    }

    #[tokio::test]
    async fn test_retry_budget_forces_termination() {
        // Model always grades no and never produces a useful transform —
        // every structured call errors. Generation also errors, so the turn
        // must end with the fallback answer, within the budget.
        let generator = ScriptedGenerator::new(vec![], None);
        let ctl = control(seeded_engine().await, generator, None, ControlConfig::default());

        let (sink, _rx) = EventSink::new();
        let outcome = ctl
            .run_turn(request("completely unanswerable question"), &sink)
            .await
            .unwrap();

        // Grading fail-open means docs are accepted, generation fails, the
        // fallback answer comes back, and the quality checks fail open too.
        match outcome {
            TurnOutcome::Complete { answer, state } => {
                assert!(answer.contains("could not find"));
                assert_eq!(state.grade, Some(Grade::Yes));
                assert!(state.retry_count <= 3);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_corpus_without_web_produces_fallback() {
        let chunking = ChunkingConfig::default();
        let index = Arc::new(ChunkIndex::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(HashEmbedder::new(64)),
            chunking,
        ));
        let engine = Arc::new(RetrievalFusionEngine::new(index, None, 100));
        // Three transform attempts then forced generation; the transform
        // calls and generation all error.
        let generator = ScriptedGenerator::new(vec![], None);
        let ctl = control(engine, generator, None, ControlConfig::default());

        let (sink, rx) = EventSink::new();
        let outcome = ctl.run_turn(request("anything at all"), &sink).await.unwrap();

        match outcome {
            TurnOutcome::Complete { answer, state } => {
                assert!(answer.contains("could not find"));
                assert_eq!(state.retry_count, 3);
                assert!(state.kb_docs.is_empty());
                // Empty material short-circuits the quality checks.
                assert_eq!(state.grounded, Some(BinaryGrade::Yes));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        let nodes = statuses(&collect(rx).await);
        assert_eq!(nodes.iter().filter(|n| *n == "retrieve").count(), 4);
        assert!(matches!(nodes.last().map(|s| s.as_str()), Some("done")));
    }

    #[tokio::test]
    async fn test_human_approval_suspends_and_approval_resumes() {
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("Approved answer."),
        );
        let config = ControlConfig {
            human_approval: true,
            ..Default::default()
        };
        let ctl = control(seeded_engine().await, generator, None, config);

        let (sink, rx) = EventSink::new();
        let outcome = ctl
            .run_turn(request("starter plan price"), &sink)
            .await
            .unwrap();

        let suspended = match outcome {
            TurnOutcome::Suspended(s) => s,
            other => panic!("expected suspension, got {:?}", other),
        };
        assert_eq!(suspended.resume_node, Node::HumanApproval);
        let events = collect(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::Interrupt { .. })));

        // Round-trip through JSON the way a server would park it.
        let parked = SuspendedTurn::from_json(&suspended.to_json().unwrap()).unwrap();

        let (sink, _rx) = EventSink::new();
        let outcome = ctl
            .resume(parked, ResumeSignal::Approved, &sink)
            .await
            .unwrap();
        match outcome {
            TurnOutcome::Complete { answer, .. } => assert_eq!(answer, "Approved answer."),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_human_rejection_costs_a_retry() {
        // Suspend, reject, observe a transform and a second suspension with
        // the retry count bumped.
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "query": "completely different query wording" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("unused"),
        );
        let config = ControlConfig {
            human_approval: true,
            ..Default::default()
        };
        let ctl = control(seeded_engine().await, generator, None, config);

        let (sink, _rx) = EventSink::new();
        let suspended = match ctl
            .run_turn(request("starter plan price"), &sink)
            .await
            .unwrap()
        {
            TurnOutcome::Suspended(s) => s,
            other => panic!("expected suspension, got {:?}", other),
        };
        assert_eq!(suspended.state.retry_count, 0);

        let (sink, _rx) = EventSink::new();
        let outcome = ctl
            .resume(suspended, ResumeSignal::Rejected, &sink)
            .await
            .unwrap();
        match outcome {
            TurnOutcome::Suspended(s) => {
                assert_eq!(s.state.retry_count, 1);
                assert_eq!(s.state.tried_queries.len(), 2);
            }
            other => panic!("expected second suspension, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_feedback_is_an_implicit_rejection() {
        // Feedback sends the turn back through transform and retrieval like
        // a rejection, and the guidance survives into the retried pass.
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "query": "totally different follow up wording" }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("Short answer."),
        );
        let config = ControlConfig {
            human_approval: true,
            ..Default::default()
        };
        let ctl = control(seeded_engine().await, generator, None, config);

        let (sink, _rx) = EventSink::new();
        let suspended = match ctl
            .run_turn(request("starter plan price"), &sink)
            .await
            .unwrap()
        {
            TurnOutcome::Suspended(s) => s,
            other => panic!("expected suspension, got {:?}", other),
        };
        assert_eq!(suspended.state.retry_count, 0);

        let (sink, rx) = EventSink::new();
        let outcome = ctl
            .resume(
                suspended,
                ResumeSignal::Feedback("keep it short".to_string()),
                &sink,
            )
            .await
            .unwrap();

        // The retried pass re-suspends at the gate with the retry charged
        // and the feedback still recorded.
        let suspended = match outcome {
            TurnOutcome::Suspended(s) => s,
            other => panic!("expected second suspension, got {:?}", other),
        };
        assert_eq!(suspended.state.retry_count, 1);
        assert_eq!(suspended.state.tried_queries.len(), 2);
        assert_eq!(
            suspended.state.human_feedback.as_deref(),
            Some("keep it short")
        );
        assert!(statuses(&collect(rx).await).contains(&"transform_query".to_string()));

        let (sink, _rx) = EventSink::new();
        let outcome = ctl
            .resume(suspended, ResumeSignal::Approved, &sink)
            .await
            .unwrap();
        match outcome {
            TurnOutcome::Complete { answer, state } => {
                assert_eq!(answer, "Short answer.");
                assert_eq!(state.human_feedback.as_deref(), Some("keep it short"));
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auto_approve_after_budget() {
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("auto approved"),
        );
        let config = ControlConfig {
            human_approval: true,
            auto_approve_after: 0,
            ..Default::default()
        };
        let ctl = control(seeded_engine().await, generator, None, config);

        let (sink, _rx) = EventSink::new();
        let outcome = ctl
            .run_turn(request("starter plan price"), &sink)
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Complete { .. }));
    }

    #[tokio::test]
    async fn test_forced_web_search_with_empty_index_is_pure_web() {
        let chunking = ChunkingConfig::default();
        let index = Arc::new(ChunkIndex::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(HashEmbedder::new(64)),
            chunking,
        ));
        let engine = Arc::new(RetrievalFusionEngine::new(index, None, 100));
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("From the web."),
        );
        let web = Arc::new(StubWebSearch {
            hits: vec![WebHit {
                title: "Result".to_string(),
                snippet: "Fresh news.".to_string(),
                url: "https://example.com".to_string(),
            }],
        });
        let ctl = control(engine, generator, Some(web), ControlConfig::default());

        let mut req = request("latest news");
        req.force_web_search = true;

        let (sink, rx) = EventSink::new();
        let outcome = ctl.run_turn(req, &sink).await.unwrap();
        match outcome {
            TurnOutcome::Complete { state, .. } => {
                assert!(state.pure_web);
                assert!(state.kb_docs.is_empty());
                assert_eq!(state.web_docs.len(), 1);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        // Grading is skipped entirely on the forced path.
        assert!(!statuses(&collect(rx).await).contains(&"grade_documents".to_string()));
    }

    #[tokio::test]
    async fn test_forced_web_search_with_local_material_is_hybrid() {
        let generator = ScriptedGenerator::new(
            vec![
                serde_json::json!({ "queries": [] }),
                serde_json::json!({ "score": "yes" }),
                serde_json::json!({ "score": "yes" }),
            ],
            Some("Hybrid answer."),
        );
        let web = Arc::new(StubWebSearch {
            hits: vec![WebHit {
                title: "Extra".to_string(),
                snippet: "Context.".to_string(),
                url: "https://example.com".to_string(),
            }],
        });
        let ctl = control(
            seeded_engine().await,
            generator,
            Some(web),
            ControlConfig::default(),
        );

        let mut req = request("starter plan price");
        req.force_web_search = true;

        let (sink, _rx) = EventSink::new();
        let outcome = ctl.run_turn(req, &sink).await.unwrap();
        match outcome {
            TurnOutcome::Complete { state, .. } => {
                assert!(!state.pure_web);
                // The index probe graded partial; the successful search
                // upgraded it.
                assert_eq!(state.grade, Some(Grade::Yes));
                assert!(!state.kb_docs.is_empty());
                assert!(!state.web_docs.is_empty());
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_format_context_numbers_sources() {
        let state = LoopState {
            question: String::new(),
            search_query: String::new(),
            history_summary: String::new(),
            preferences: None,
            filter: MetadataFilter::default(),
            top_k: 4,
            kb_docs: vec![crate::models::Chunk {
                id: "c".to_string(),
                text: "local text".to_string(),
                metadata: ChunkMetadata {
                    source_file: "doc.md".to_string(),
                    ..Default::default()
                },
                parent_id: None,
            }],
            web_docs: vec![WebHit {
                title: "Web title".to_string(),
                snippet: "web snippet".to_string(),
                url: "https://example.com".to_string(),
            }],
            grade: None,
            tried_queries: Vec::new(),
            retry_count: 0,
            force_web_search: false,
            pure_web: false,
            human_feedback: None,
            answer: None,
            grounded: None,
            relevant: None,
        };

        let context = format_context(&state);
        assert!(context.contains("[Source 1] (file: doc.md)"));
        assert!(context.contains("[Source 2] (web: https://example.com)"));
    }
}
