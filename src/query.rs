//! Question answering over a built [`KnowledgeBase`].
//!
//! `answer` moves through `Embed → Retrieve → Expand → Synthesize` and ends
//! in `Done` or `Failed`. Any failure is returned as a [`QueryError`]; there
//! is no partial answer.
//!
//! # Context
//!
//! Retrieved entities are expanded to their 1-hop neighborhood and the
//! summaries of the communities involved; the raw text of a few source
//! reviews is added for grounding. Items are admitted in priority order
//! (similarity score, then neighbor `mention_count`) until
//! `max_context_chars` is used up, then rendered as:
//!
//! ```text
//! CONTEXT FOR YOUR ANSWER:
//!
//! ## Overall Topic Summaries
//! ## Specific Entity Relationships
//! ## Grounding Source Text from Original Reviews
//! ```
//!
//! The context depends only on the knowledge base, the index and the query
//! vector, so it is reproducible.
//!
//! # Snapshots
//!
//! The engine serves from an immutable snapshot (knowledge base + index).
//! [`QueryEngine::swap`] builds the next snapshot first and then replaces the
//! pointer, so in-flight queries finish against the snapshot they started with.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::community::membership;
use crate::config::QueryConfig;
use crate::error::{OracleError, QueryError};
use crate::index::{Metric, SearchHit, VectorIndex};
use crate::models::{CommunityId, DocumentId, EntityId, OwnerId, RelationId};
use crate::oracle::{prompts, EmbeddingOracle, Oracles, RetryPolicy, TextOracle};
use crate::pipeline::KnowledgeBase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub top_k: usize,
    pub max_context_chars: usize,
    pub max_source_documents: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            max_context_chars: 8000,
            max_source_documents: 3,
        }
    }
}

impl From<&QueryConfig> for QueryOptions {
    fn from(config: &QueryConfig) -> Self {
        Self {
            top_k: config.top_k,
            max_context_chars: config.max_context_chars,
            max_source_documents: config.max_source_documents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Embed,
    Retrieve,
    Expand,
    Synthesize,
    Done,
    Failed,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryStage::Embed => "embed",
            QueryStage::Retrieve => "retrieve",
            QueryStage::Expand => "expand",
            QueryStage::Synthesize => "synthesize",
            QueryStage::Done => "done",
            QueryStage::Failed => "failed",
        })
    }
}

/// What contributed to an answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CitedSources {
    pub entities: BTreeSet<EntityId>,
    pub relations: BTreeSet<RelationId>,
    pub communities: BTreeSet<CommunityId>,
    pub documents: BTreeSet<DocumentId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerResult {
    pub text: String,
    pub cited_sources: CitedSources,
    /// Retrieval hits, best first.
    pub hits: Vec<SearchHit>,
    /// The exact context given to the text oracle.
    pub context: String,
}

struct Snapshot {
    kb: Arc<KnowledgeBase>,
    index: VectorIndex,
    communities: HashMap<EntityId, CommunityId>,
}

impl Snapshot {
    fn new(kb: Arc<KnowledgeBase>) -> Result<Self> {
        let index = kb.index()?;
        let communities = membership(&kb.communities);
        Ok(Self {
            kb,
            index,
            communities,
        })
    }
}

pub struct QueryEngine {
    snapshot: RwLock<Arc<Snapshot>>,
    embedding: Arc<dyn EmbeddingOracle>,
    text: Arc<dyn TextOracle>,
    metric: Metric,
    retry: RetryPolicy,
    options: QueryOptions,
}

impl QueryEngine {
    /// `metric` is the configured metric; a knowledge base indexed with a
    /// different one is rejected at query time.
    pub fn new(
        kb: Arc<KnowledgeBase>,
        oracles: &Oracles,
        metric: Metric,
        retry: RetryPolicy,
        options: QueryOptions,
    ) -> Result<Self> {
        Ok(Self {
            snapshot: RwLock::new(Arc::new(Snapshot::new(kb)?)),
            embedding: oracles.embedding.clone(),
            text: oracles.text.clone(),
            metric,
            retry,
            options,
        })
    }

    /// Serve queries from `kb` from now on.
    pub fn swap(&self, kb: Arc<KnowledgeBase>) -> Result<()> {
        let next = Arc::new(Snapshot::new(kb)?);
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
        Ok(())
    }

    pub fn knowledge_base(&self) -> Arc<KnowledgeBase> {
        self.current().kb.clone()
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn answer(&self, question: &str, k: Option<usize>) -> Result<AnswerResult, QueryError> {
        self.answer_with_cancel(question, k, &CancellationToken::new()).await
    }

    pub async fn answer_with_cancel(
        &self,
        question: &str,
        k: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<AnswerResult, QueryError> {
        let result = self.run(question, k, cancel).await;
        match &result {
            Ok(answer) => tracing::debug!(
                stage = %QueryStage::Done,
                hits = answer.hits.len(),
                context_chars = answer.context.len(),
                "query answered"
            ),
            Err(e) => tracing::warn!(stage = %QueryStage::Failed, error = %e, "query failed"),
        }
        result
    }

    async fn run(&self, question: &str, k: Option<usize>, cancel: &CancellationToken) -> Result<AnswerResult, QueryError> {
        let snapshot = self.current();
        let k = k.unwrap_or(self.options.top_k);

        tracing::debug!(stage = %QueryStage::Embed, "query stage");
        if snapshot.index.is_empty() || k == 0 {
            return Err(QueryError::NothingRetrieved);
        }
        self.check_compatible(&snapshot.index)?;
        let vector = self
            .retry
            .run("embed query", || self.embedding.embed(question))
            .await
            .map_err(QueryError::QueryEmbedding)?;
        if vector.len() != snapshot.index.dims() {
            return Err(QueryError::EmbeddingMismatch {
                expected: format!("{} dimensions", snapshot.index.dims()),
                actual: format!("{} dimensions", vector.len()),
            });
        }
        check_cancel(cancel)?;

        tracing::debug!(stage = %QueryStage::Retrieve, k, "query stage");
        let hits = snapshot.index.search(&vector, k);
        check_cancel(cancel)?;

        tracing::debug!(stage = %QueryStage::Expand, hits = hits.len(), "query stage");
        let (context, cited_sources) =
            build_context(&snapshot, &hits, &self.options).ok_or(QueryError::NothingRetrieved)?;
        check_cancel(cancel)?;

        tracing::debug!(stage = %QueryStage::Synthesize, "query stage");
        let prompt = prompts::answer_prompt(&context, question);
        let text = self
            .retry
            .run("synthesize", || self.text.generate(&prompt))
            .await
            .map_err(QueryError::Synthesis)?;
        if text.trim().is_empty() {
            return Err(QueryError::Synthesis(OracleError::Malformed(
                "empty answer".to_string(),
            )));
        }

        Ok(AnswerResult {
            text: text.trim().to_string(),
            cited_sources,
            hits,
            context,
        })
    }

    fn check_compatible(&self, index: &VectorIndex) -> Result<(), QueryError> {
        let expected = format!("{} ({} dims, {})", index.model(), index.dims(), index.metric().as_str());
        let actual = format!(
            "{} ({} dims, {})",
            self.embedding.model_name(),
            self.embedding.dims(),
            self.metric.as_str()
        );
        if expected != actual {
            return Err(QueryError::EmbeddingMismatch { expected, actual });
        }
        Ok(())
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), QueryError> {
    if cancel.is_cancelled() {
        Err(QueryError::Cancelled)
    } else {
        Ok(())
    }
}

/// Tracks the remaining context budget.
struct Budget {
    remaining: usize,
}

impl Budget {
    fn take(&mut self, line: &str) -> bool {
        let cost = line.len() + 1;
        if cost > self.remaining {
            return false;
        }
        self.remaining -= cost;
        true
    }
}

/// Longest prefix of `text` that fits in `max` bytes on a char boundary.
fn truncate_to(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn add_summary(
    snapshot: &Snapshot,
    community_id: CommunityId,
    budget: &mut Budget,
    cited: &mut CitedSources,
    summaries: &mut Vec<String>,
) {
    if cited.communities.contains(&community_id) {
        return;
    }
    let Some(community) = snapshot.kb.communities.iter().find(|c| c.id == community_id) else {
        return;
    };
    if community.flagged || community.summary.trim().is_empty() {
        return;
    }
    let line = format!(
        "This topic belongs to a community summarized as: '{}'",
        community.summary
    );
    if budget.take(&line) {
        summaries.push(line);
        cited.communities.insert(community_id);
    }
}

fn build_context(
    snapshot: &Snapshot,
    hits: &[SearchHit],
    options: &QueryOptions,
) -> Option<(String, CitedSources)> {
    let graph = &snapshot.kb.graph;
    let mut budget = Budget {
        remaining: options.max_context_chars,
    };
    let mut cited = CitedSources::default();
    let mut summaries: Vec<String> = Vec::new();
    let mut blocks: Vec<String> = Vec::new();
    let mut sources: Vec<String> = Vec::new();
    let mut entry_entities: Vec<EntityId> = Vec::new();
    let mut expanded: Vec<EntityId> = Vec::new();

    for hit in hits {
        match hit.owner_id {
            OwnerId::Entity(id) => {
                let Some(entity) = graph.entity(id) else { continue };
                if entry_entities.contains(&id) {
                    continue;
                }
                let header = format!(
                    "Entity '{}' (Type: {}) is related to:",
                    entity.canonical_name, entity.entity_type
                );
                if !budget.take(&header) {
                    continue;
                }
                cited.entities.insert(id);
                cited.documents.extend(entity.source_document_ids.iter().cloned());
                entry_entities.push(id);

                let mut neighbors = graph.neighbors(id);
                neighbors.sort_by(|(ra, ea), (rb, eb)| {
                    let ma = graph.entity(*ea).map_or(0, |e| e.mention_count);
                    let mb = graph.entity(*eb).map_or(0, |e| e.mention_count);
                    mb.cmp(&ma).then(ra.cmp(rb))
                });

                let mut lines = vec![header];
                if neighbors.is_empty() {
                    let line = "  - No direct relationships found.".to_string();
                    if budget.take(&line) {
                        lines.push(line);
                    }
                }
                for (rid, other_id) in neighbors {
                    let (Some(relation), Some(other)) = (graph.relation(rid), graph.entity(other_id)) else {
                        continue;
                    };
                    let arrow = if relation.subject == id {
                        format!("-[{}]->", relation.predicate)
                    } else {
                        format!("<-[{}]-", relation.predicate)
                    };
                    let line = format!(
                        "  - {} '{}' (Type: {})",
                        arrow, other.canonical_name, other.entity_type
                    );
                    if budget.take(&line) {
                        lines.push(line);
                        cited.relations.insert(rid);
                        cited.entities.insert(other_id);
                        if !expanded.contains(&other_id) {
                            expanded.push(other_id);
                        }
                    }
                }
                blocks.push(lines.join("\n"));

                if let Some(&community_id) = snapshot.communities.get(&id) {
                    add_summary(snapshot, community_id, &mut budget, &mut cited, &mut summaries);
                }
            }
            OwnerId::Community(community_id) => {
                add_summary(snapshot, community_id, &mut budget, &mut cited, &mut summaries);
            }
        }
    }

    for id in &expanded {
        if let Some(&community_id) = snapshot.communities.get(id) {
            add_summary(snapshot, community_id, &mut budget, &mut cited, &mut summaries);
        }
    }

    let mut seen_documents: HashSet<&str> = HashSet::new();
    'entities: for id in &entry_entities {
        let Some(entity) = graph.entity(*id) else { continue };
        for document_id in &entity.source_document_ids {
            if seen_documents.len() >= options.max_source_documents {
                break 'entities;
            }
            if !seen_documents.insert(document_id.as_str()) {
                continue;
            }
            let Some(document) = snapshot.kb.documents.get(document_id) else {
                continue;
            };
            let open = format!("--- START OF RELEVANT REVIEW ({}) ---", document_id);
            let close = "--- END OF REVIEW ---";
            let overhead = open.len() + close.len() + 3;
            if budget.remaining <= overhead {
                break 'entities;
            }
            let text = truncate_to(document.text.trim(), budget.remaining - overhead);
            let block = format!("{}\n{}\n{}", open, text, close);
            if budget.take(&block) {
                sources.push(block);
                cited.documents.insert(document_id.clone());
            }
        }
    }

    if blocks.is_empty() && summaries.is_empty() {
        return None;
    }

    let mut context = String::from("CONTEXT FOR YOUR ANSWER:\n\n");
    if !summaries.is_empty() {
        context.push_str("## Overall Topic Summaries\n");
        context.push_str(&summaries.join("\n"));
        context.push_str("\n\n");
    }
    if !blocks.is_empty() {
        context.push_str("## Specific Entity Relationships\n");
        context.push_str(&blocks.join("\n\n"));
        context.push_str("\n\n");
    }
    if !sources.is_empty() {
        context.push_str("## Grounding Source Text from Original Reviews\n");
        context.push_str(&sources.join("\n\n"));
    }
    Some((context, cited))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::index::Indexer;
    use crate::models::{Community, Document, EntityType};
    use crate::oracle::StubOracle;
    use std::collections::BTreeMap;

    fn knowledge_base() -> KnowledgeBase {
        let mut graph = Graph::new();
        let (crash, _) = graph.upsert_entity("login crash", EntityType::BugReport, "d1", 2);
        let (login, _) = graph.upsert_entity("login", EntityType::ProductComponent, "d1", 1);
        let (dark, _) = graph.upsert_entity("dark mode", EntityType::FeatureRequest, "d2", 1);
        graph.upsert_relation(crash, "related_to", login, "d1");
        graph.mark_ingested("d1");
        graph.mark_ingested("d2");

        let mut documents = BTreeMap::new();
        documents.insert("d1".to_string(), Document::new("d1", "App crashes on login, please fix"));
        documents.insert("d2".to_string(), Document::new("d2", "Would love a dark mode option"));

        let communities = vec![
            Community {
                id: CommunityId(0),
                member_entity_ids: [crash, login].into_iter().collect(),
                summary: "Login is unstable.".into(),
                summary_hash: String::new(),
                flagged: false,
                miscellaneous: false,
            },
            Community {
                id: CommunityId(1),
                member_entity_ids: [dark].into_iter().collect(),
                summary: "Summary generation failed.".into(),
                summary_hash: String::new(),
                flagged: true,
                miscellaneous: true,
            },
        ];

        let stub = crate::oracle::stub::hashed_bow;
        let mut entries = BTreeMap::new();
        for e in graph.entities() {
            entries.insert(
                OwnerId::Entity(e.id),
                crate::index::IndexEntry {
                    content_hash: crate::index::content_hash("stub-hash-bow", &e.embedding_text()),
                    vector: stub(&e.embedding_text(), 64),
                },
            );
        }

        KnowledgeBase {
            documents,
            graph,
            communities,
            indexer: Indexer::from_entries("stub-hash-bow", 64, Metric::Cosine, entries),
        }
    }

    fn oracles(dims: usize) -> Oracles {
        let stub = Arc::new(StubOracle::new(dims));
        Oracles {
            structure: stub.clone(),
            embedding: stub.clone(),
            text: stub,
        }
    }

    fn engine(dims: usize, options: QueryOptions) -> QueryEngine {
        QueryEngine::new(
            Arc::new(knowledge_base()),
            &oracles(dims),
            Metric::Cosine,
            RetryPolicy::immediate(1),
            options,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn answers_with_sections_in_order() {
        let engine = engine(64, QueryOptions::default());
        let answer = engine.answer("What bugs are reported?", Some(3)).await.unwrap();

        let summaries = answer.context.find("## Overall Topic Summaries").unwrap();
        let relations = answer.context.find("## Specific Entity Relationships").unwrap();
        let grounding = answer.context.find("## Grounding Source Text").unwrap();
        assert!(summaries < relations && relations < grounding);
        assert!(answer.context.contains("-[related_to]-> 'login'"));
        assert!(!answer.context.contains("Summary generation failed."));
        assert!(answer.cited_sources.documents.contains("d1"));
        assert!(answer.cited_sources.communities.contains(&CommunityId(0)));
        assert!(!answer.text.is_empty());
    }

    /// Text oracle with one canned reply.
    struct CannedAnswer(Result<String, OracleError>);

    #[async_trait::async_trait]
    impl TextOracle for CannedAnswer {
        async fn generate(&self, _prompt: &str) -> Result<String, OracleError> {
            self.0.clone()
        }
    }

    fn engine_with_answer(reply: Result<String, OracleError>) -> QueryEngine {
        let oracles = Oracles {
            text: Arc::new(CannedAnswer(reply)),
            ..oracles(64)
        };
        QueryEngine::new(
            Arc::new(knowledge_base()),
            &oracles,
            Metric::Cosine,
            RetryPolicy::immediate(2),
            QueryOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn synthesis_oracle_error_fails_the_query() {
        let engine = engine_with_answer(Err(OracleError::Rejected("content filter".into())));
        let err = engine.answer("What bugs are reported?", None).await.unwrap_err();
        assert!(matches!(err, QueryError::Synthesis(OracleError::Rejected(_))), "got {:?}", err);
    }

    #[tokio::test]
    async fn blank_answer_fails_the_query() {
        let engine = engine_with_answer(Ok("   ".into()));
        let err = engine.answer("What bugs are reported?", None).await.unwrap_err();
        assert!(matches!(err, QueryError::Synthesis(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn context_is_reproducible() {
        let engine = engine(64, QueryOptions::default());
        let a = engine.answer("login problems", None).await.unwrap();
        let b = engine.answer("login problems", None).await.unwrap();
        assert_eq!(a.context, b.context);
        assert_eq!(a.cited_sources, b.cited_sources);
    }

    #[tokio::test]
    async fn dimension_drift_is_a_mismatch() {
        let engine = engine(32, QueryOptions::default());
        let err = engine.answer("What bugs are reported?", None).await.unwrap_err();
        assert!(matches!(err, QueryError::EmbeddingMismatch { .. }));
    }

    #[tokio::test]
    async fn metric_drift_is_a_mismatch() {
        let engine = QueryEngine::new(
            Arc::new(knowledge_base()),
            &oracles(64),
            Metric::InnerProduct,
            RetryPolicy::immediate(1),
            QueryOptions::default(),
        )
        .unwrap();
        let err = engine.answer("anything", None).await.unwrap_err();
        assert!(matches!(err, QueryError::EmbeddingMismatch { .. }));
    }

    #[tokio::test]
    async fn empty_knowledge_base_retrieves_nothing() {
        let engine = QueryEngine::new(
            Arc::new(KnowledgeBase::default()),
            &oracles(64),
            Metric::Cosine,
            RetryPolicy::immediate(1),
            QueryOptions::default(),
        )
        .unwrap();
        let err = engine.answer("anything", None).await.unwrap_err();
        assert!(matches!(err, QueryError::NothingRetrieved));
    }

    #[tokio::test]
    async fn budget_limits_context() {
        let options = QueryOptions {
            max_context_chars: 60,
            ..QueryOptions::default()
        };
        let engine = engine(64, options);
        let answer = engine.answer("login crash", Some(3)).await.unwrap();
        assert!(!answer.context.contains("## Grounding Source Text"));
        assert_eq!(answer.cited_sources.entities.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_query_returns_cancelled() {
        let engine = engine(64, QueryOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .answer_with_cancel("What bugs are reported?", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
    }

    #[tokio::test]
    async fn swap_serves_new_snapshot() {
        let engine = engine(64, QueryOptions::default());
        engine.swap(Arc::new(KnowledgeBase::default())).unwrap();
        assert!(engine.knowledge_base().graph.is_empty());
        assert!(matches!(
            engine.answer("anything", None).await,
            Err(QueryError::NothingRetrieved)
        ));
    }
}
