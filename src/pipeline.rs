//! Build pipeline: documents → graph → communities → index.
//!
//! ```text
//! documents ──► extract (≤ workers in flight) ──► mpsc ──► single-writer merge
//!                                                             │
//!               detect ◄──────────────────────────────────────┘
//!                 │
//!                 ▼
//!             summarize (≤ workers in flight) ──► embed stale objects (≤ workers)
//! ```
//!
//! Extraction results arrive in completion order and are merged in input
//! order through a reorder buffer, so entity ids do not depend on oracle
//! latency. Detection starts only after every merge is done.
//!
//! Cancellation is checked before each document, community and embedded
//! object. A cancelled build leaves the graph consistent (only fully merged
//! documents are in it) and sets [`BuildReport::cancelled`]; communities and
//! the index are then not refreshed.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::assemble;
use crate::community::{self, Detector, SummaryOptions};
use crate::config::Config;
use crate::error::ExtractionError;
use crate::extract::extract;
use crate::graph::Graph;
use crate::index::{self, Indexer, Metric, VectorIndex};
use crate::models::{Community, Document, DocumentId, ExtractionResult};
use crate::oracle::{Oracles, RetryPolicy};
use crate::progress::{BuildPhase, NoProgress, ProgressEvent, ProgressReporter};
use crate::report::BuildReport;

/// Everything a build produces and a query reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeBase {
    /// Ingested documents, kept for source-text grounding.
    pub documents: BTreeMap<DocumentId, Document>,
    pub graph: Graph,
    pub communities: Vec<Community>,
    pub indexer: Indexer,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self) -> Result<VectorIndex> {
        self.indexer.build_index()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub detector: Detector,
    pub summary: SummaryOptions,
    pub metric: Metric,
    pub embed_communities: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            detector: Detector::default(),
            summary: SummaryOptions::default(),
            metric: Metric::Cosine,
            embed_communities: true,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            workers: config.pipeline.workers,
            retry: config.retry.policy(),
            detector: Detector::from_config(&config.community)?,
            summary: SummaryOptions::from(&config.community),
            metric: config.index.metric()?,
            embed_communities: config.index.embed_communities,
        })
    }
}

type Extracted = Option<Result<Option<ExtractionResult>, ExtractionError>>;

pub struct Pipeline {
    oracles: Oracles,
    options: PipelineOptions,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(oracles: Oracles, options: PipelineOptions) -> Self {
        Self {
            oracles,
            options,
            cancel: CancellationToken::new(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Extend `kb` with `documents` and refresh communities and the index.
    ///
    /// Documents already in the graph and documents with empty text are
    /// skipped. Per-unit failures are collected in the returned report.
    pub async fn build(&self, kb: &mut KnowledgeBase, documents: Vec<Document>) -> BuildReport {
        let mut report = BuildReport {
            documents_seen: documents.len(),
            ..BuildReport::default()
        };

        let mut queued = BTreeSet::new();
        let mut work = Vec::new();
        for document in documents {
            if kb.graph.is_ingested(&document.id) || !queued.insert(document.id.clone()) {
                report.documents_already_ingested += 1;
            } else if document.text.trim().is_empty() {
                report.documents_skipped_empty += 1;
            } else {
                work.push(document);
            }
        }

        self.extract_and_merge(kb, work, &mut report).await;
        if self.cancel.is_cancelled() {
            report.cancelled = true;
            tracing::warn!("build cancelled after extraction");
            return report;
        }

        self.refresh_communities(kb, &mut report).await;
        if report.cancelled {
            return report;
        }

        let targets = index::targets(&kb.graph, &kb.communities, self.options.embed_communities);
        let refresh = kb
            .indexer
            .refresh(
                &targets,
                self.oracles.embedding.clone(),
                self.options.metric,
                self.options.retry,
                self.options.workers,
                &self.cancel,
                self.progress.as_ref(),
            )
            .await;
        report.embedded = refresh.embedded;
        report.embeddings_reused = refresh.reused;
        report.embeddings_removed = refresh.removed;
        report.embedding_failures = refresh.failures;
        report.cancelled |= refresh.cancelled;

        tracing::info!(
            documents = report.documents_ingested,
            entities = kb.graph.entity_count(),
            relations = kb.graph.relation_count(),
            communities = kb.communities.len(),
            failures = report.failure_count(),
            "build finished"
        );
        report
    }

    async fn extract_and_merge(&self, kb: &mut KnowledgeBase, work: Vec<Document>, report: &mut BuildReport) {
        let total = work.len() as u64;
        if work.is_empty() {
            return;
        }

        let workers = self.options.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let (tx, mut rx) = mpsc::channel::<(usize, Document, Extracted)>(workers * 2);
        let mut tasks = JoinSet::new();

        for (seq, document) in work.into_iter().enumerate() {
            let tx = tx.clone();
            let oracle = self.oracles.structure.clone();
            let semaphore = semaphore.clone();
            let cancel = self.cancel.clone();
            let retry = self.options.retry;
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) if !cancel.is_cancelled() => {
                        Some(extract(&document, oracle.as_ref(), &retry).await)
                    }
                    _ => None,
                };
                let _ = tx.send((seq, document, outcome)).await;
            });
        }
        drop(tx);

        // Single writer: the graph is only touched here.
        let mut reorder: BTreeMap<usize, (Document, Extracted)> = BTreeMap::new();
        let mut next = 0usize;
        let mut done = 0u64;
        while let Some((seq, document, outcome)) = rx.recv().await {
            reorder.insert(seq, (document, outcome));
            while let Some((document, outcome)) = reorder.remove(&next) {
                next += 1;
                apply_extraction(kb, report, document, outcome);
                done += 1;
                self.progress.report(ProgressEvent {
                    phase: BuildPhase::Extract,
                    n: done,
                    total,
                });
            }
        }
        // Only reachable with gaps if a task panicked.
        for (_, (document, outcome)) in std::mem::take(&mut reorder) {
            apply_extraction(kb, report, document, outcome);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "extraction task failed");
            }
        }
    }

    async fn refresh_communities(&self, kb: &mut KnowledgeBase, report: &mut BuildReport) {
        let needs_detection = report.documents_ingested > 0
            || (kb.communities.is_empty() && !kb.graph.is_empty());
        if needs_detection {
            let mut fresh = community::detect(&kb.graph, &self.options.detector);
            report.summaries_reused = community::carry_over_summaries(
                &mut fresh,
                &kb.communities,
                &kb.graph,
                &self.options.summary,
            );
            kb.communities = fresh;
        }
        report.communities = kb.communities.len();

        let outcome = community::summarize_all(
            &mut kb.communities,
            &kb.graph,
            self.oracles.text.clone(),
            self.options.retry,
            &self.options.summary,
            self.options.workers,
            &self.cancel,
            self.progress.as_ref(),
        )
        .await;
        report.summaries_generated = outcome.summarized;
        report.summarization_failures = outcome.failures;
        report.cancelled |= outcome.cancelled;
    }
}

fn apply_extraction(kb: &mut KnowledgeBase, report: &mut BuildReport, document: Document, outcome: Extracted) {
    match outcome {
        None => report.cancelled = true,
        Some(Ok(None)) => report.documents_skipped_empty += 1,
        Some(Ok(Some(result))) => {
            let merged = assemble::merge(&mut kb.graph, &result);
            if merged.already_ingested {
                report.documents_already_ingested += 1;
                return;
            }
            report.documents_ingested += 1;
            report.entities_created += merged.entities_created;
            report.entities_merged += merged.entities_merged;
            report.relations_created += merged.relations_created;
            report.relations_merged += merged.relations_merged;
            report.dangling_relations.extend(merged.dangling);
            kb.documents.insert(document.id.clone(), document);
        }
        Some(Err(err)) => {
            tracing::warn!(
                document_id = %err.document_id,
                reason = %err.reason,
                "extraction failed: {}",
                err.message
            );
            report.extraction_errors.push(err);
        }
    }
}
