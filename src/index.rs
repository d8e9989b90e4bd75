//! Vector index over entities and community summaries.
//!
//! - [`Indexer`] keeps one embedding per owned object together with a
//!   SHA-256 of the embedding model and text that produced it. A refresh
//!   embeds only objects whose hash changed, drops objects that no longer
//!   exist, and starts over when the model, dimensionality or metric changes.
//! - [`VectorIndex`] is an immutable, exact (brute-force) index built from
//!   the indexer's records. [`VectorIndex::search`] orders hits by descending
//!   score with ties broken by ascending [`OwnerId`].
//!
//! Also provides the vector utilities used by persistence:
//! [`vec_to_blob`], [`blob_to_vec`], [`cosine_similarity`].

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{EmbeddingFailure, ReasonCode};
use crate::graph::Graph;
use crate::models::{Community, EmbeddingRecord, OwnerId};
use crate::oracle::{EmbeddingOracle, RetryPolicy};
use crate::progress::{BuildPhase, ProgressEvent, ProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    InnerProduct,
}

impl Metric {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "inner_product" => Ok(Metric::InnerProduct),
            other => bail!("Unknown metric: '{}'. Must be cosine or inner_product.", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::InnerProduct => "inner_product",
        }
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::InnerProduct => a.iter().zip(b).map(|(x, y)| x * y).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub owner_id: OwnerId,
    pub score: f32,
}

/// Exact nearest-neighbor index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    metric: Metric,
    records: Vec<EmbeddingRecord>,
}

impl VectorIndex {
    /// Build an index from `records`. Every vector must have `dims` entries.
    pub fn build(
        model: impl Into<String>,
        dims: usize,
        metric: Metric,
        mut records: Vec<EmbeddingRecord>,
    ) -> Result<Self> {
        if let Some(bad) = records.iter().find(|r| r.vector.len() != dims) {
            bail!(
                "record {} has {} dimensions, index expects {}",
                bad.owner_id,
                bad.vector.len(),
                dims
            );
        }
        records.sort_by_key(|r| r.owner_id);
        Ok(Self {
            model: model.into(),
            dims,
            metric,
            records,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    /// Top-`k` records for `query`: descending score, ties by ascending
    /// owner id. NaN scores are never returned.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = self
            .records
            .iter()
            .filter_map(|r| {
                // `+ 0.0` folds -0.0 into 0.0 so equal scores compare equal.
                let score = self.metric.score(query, &r.vector) + 0.0;
                (!score.is_nan()).then_some(SearchHit {
                    owner_id: r.owner_id,
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.owner_id.cmp(&b.owner_id))
        });
        hits.truncate(k);
        hits
    }
}

/// An object to embed and the text that represents it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedTarget {
    pub owner_id: OwnerId,
    pub text: String,
}

/// Entities (`"name (TYPE)"`) and, when enabled, community summaries.
/// Communities with a placeholder summary are not embedded.
pub fn targets(graph: &Graph, communities: &[Community], embed_communities: bool) -> Vec<EmbedTarget> {
    let mut out: Vec<EmbedTarget> = graph
        .entities()
        .iter()
        .map(|e| EmbedTarget {
            owner_id: OwnerId::Entity(e.id),
            text: e.embedding_text(),
        })
        .collect();
    if embed_communities {
        out.extend(
            communities
                .iter()
                .filter(|c| !c.flagged && !c.summary.trim().is_empty())
                .map(|c| EmbedTarget {
                    owner_id: OwnerId::Community(c.id),
                    text: c.summary.clone(),
                }),
        );
    }
    out
}

/// SHA-256 over model name and text, hex-encoded.
pub fn content_hash(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A stored embedding plus the hash of what produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub content_hash: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub embedded: usize,
    pub reused: usize,
    pub removed: usize,
    pub failures: Vec<EmbeddingFailure>,
    pub cancelled: bool,
}

/// Incremental embedding store.
#[derive(Debug, Clone, PartialEq)]
pub struct Indexer {
    model: String,
    dims: usize,
    metric: Metric,
    entries: BTreeMap<OwnerId, IndexEntry>,
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new("", 0, Metric::Cosine)
    }
}

impl Indexer {
    pub fn new(model: impl Into<String>, dims: usize, metric: Metric) -> Self {
        Self {
            model: model.into(),
            dims,
            metric,
            entries: BTreeMap::new(),
        }
    }

    /// Restore an indexer from persisted entries.
    pub fn from_entries(
        model: impl Into<String>,
        dims: usize,
        metric: Metric,
        entries: BTreeMap<OwnerId, IndexEntry>,
    ) -> Self {
        Self {
            model: model.into(),
            dims,
            metric,
            entries,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn entries(&self) -> &BTreeMap<OwnerId, IndexEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Targets whose stored hash differs from their current content.
    pub fn stale<'a>(&self, targets: &'a [EmbedTarget]) -> Vec<&'a EmbedTarget> {
        targets
            .iter()
            .filter(|t| {
                self.entries
                    .get(&t.owner_id)
                    .map_or(true, |e| e.content_hash != content_hash(&self.model, &t.text))
            })
            .collect()
    }

    /// Bring the stored embeddings in line with `targets`.
    ///
    /// A persistent failure for one object removes it from the index and is
    /// reported; it never aborts the refresh.
    #[allow(clippy::too_many_arguments)]
    pub async fn refresh(
        &mut self,
        targets: &[EmbedTarget],
        oracle: Arc<dyn EmbeddingOracle>,
        metric: Metric,
        retry: RetryPolicy,
        workers: usize,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();

        if self.model != oracle.model_name() || self.dims != oracle.dims() || self.metric != metric {
            if !self.entries.is_empty() {
                tracing::info!(
                    from = %self.model,
                    to = %oracle.model_name(),
                    "embedding configuration changed, re-embedding everything"
                );
            }
            *self = Indexer::new(oracle.model_name(), oracle.dims(), metric);
        }

        let live: BTreeSet<OwnerId> = targets.iter().map(|t| t.owner_id).collect();
        let before = self.entries.len();
        self.entries.retain(|owner, _| live.contains(owner));
        outcome.removed = before - self.entries.len();

        let stale: Vec<EmbedTarget> = self.stale(targets).into_iter().cloned().collect();
        outcome.reused = targets.len() - stale.len();
        let total = stale.len() as u64;
        if stale.is_empty() {
            return outcome;
        }

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();
        for target in stale {
            let oracle = oracle.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let dims = self.dims;
            let hash = content_hash(&self.model, &target.text);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (target.owner_id, hash, None);
                };
                if cancel.is_cancelled() {
                    return (target.owner_id, hash, None);
                }
                let result = retry
                    .run("embed", || oracle.embed(&target.text))
                    .await
                    .map_err(|e| EmbeddingFailure {
                        owner_id: target.owner_id,
                        reason: ReasonCode::for_oracle(&e),
                        message: e.to_string(),
                    })
                    .and_then(|vector| {
                        if vector.len() == dims {
                            Ok(vector)
                        } else {
                            Err(EmbeddingFailure {
                                owner_id: target.owner_id,
                                reason: ReasonCode::MalformedResponse,
                                message: format!(
                                    "expected {} dimensions, got {}",
                                    dims,
                                    vector.len()
                                ),
                            })
                        }
                    });
                (target.owner_id, hash, Some(result))
            });
        }

        let mut done = 0u64;
        while let Some(joined) = tasks.join_next().await {
            let (owner_id, hash, result) = match joined {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!(error = %e, "embedding task failed");
                    continue;
                }
            };
            match result {
                Some(Ok(vector)) => {
                    self.entries.insert(
                        owner_id,
                        IndexEntry {
                            content_hash: hash,
                            vector,
                        },
                    );
                    outcome.embedded += 1;
                }
                Some(Err(failure)) => {
                    tracing::warn!(owner_id = %owner_id, reason = %failure.reason, "{}", failure.message);
                    self.entries.remove(&owner_id);
                    outcome.failures.push(failure);
                }
                None => {
                    // Not embedded this run; a stale vector must not stay searchable.
                    self.entries.remove(&owner_id);
                    outcome.cancelled = true;
                }
            }
            done += 1;
            progress.report(ProgressEvent {
                phase: BuildPhase::Embed,
                n: done,
                total,
            });
        }

        outcome.failures.sort_by_key(|f| f.owner_id);
        outcome
    }

    /// Build a search index from the current entries.
    pub fn build_index(&self) -> Result<VectorIndex> {
        let records = self
            .entries
            .iter()
            .map(|(owner_id, entry)| EmbeddingRecord {
                owner_id: *owner_id,
                vector: entry.vector.clone(),
            })
            .collect();
        VectorIndex::build(self.model.clone(), self.dims, self.metric, records)
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, zero or
/// mismatched vectors.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::models::{CommunityId, EntityId, EntityType};
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(owner_id: OwnerId, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord { owner_id, vector }
    }

    #[test]
    fn search_orders_by_score_then_owner() {
        let index = VectorIndex::build(
            "m",
            2,
            Metric::Cosine,
            vec![
                record(OwnerId::Community(CommunityId(0)), vec![1.0, 0.0]),
                record(OwnerId::Entity(EntityId(5)), vec![1.0, 0.0]),
                record(OwnerId::Entity(EntityId(2)), vec![0.0, 1.0]),
                record(OwnerId::Entity(EntityId(1)), vec![1.0, 1.0]),
            ],
        )
        .unwrap();

        let hits = index.search(&[1.0, 0.0], 3);
        let owners: Vec<OwnerId> = hits.iter().map(|h| h.owner_id).collect();
        assert_eq!(
            owners,
            vec![
                OwnerId::Entity(EntityId(5)),
                OwnerId::Community(CommunityId(0)),
                OwnerId::Entity(EntityId(1)),
            ]
        );
        assert!(index.search(&[1.0, 0.0], 0).is_empty());
    }

    #[test]
    fn inner_product_uses_magnitude() {
        let index = VectorIndex::build(
            "m",
            1,
            Metric::InnerProduct,
            vec![
                record(OwnerId::Entity(EntityId(0)), vec![1.0]),
                record(OwnerId::Entity(EntityId(1)), vec![3.0]),
            ],
        )
        .unwrap();
        let hits = index.search(&[2.0], 10);
        assert_eq!(hits[0].owner_id, OwnerId::Entity(EntityId(1)));
        assert_eq!(hits[0].score, 6.0);
    }

    #[test]
    fn build_rejects_wrong_dims() {
        let result = VectorIndex::build(
            "m",
            3,
            Metric::Cosine,
            vec![record(OwnerId::Entity(EntityId(0)), vec![1.0])],
        );
        assert!(result.is_err());
    }

    #[test]
    fn blob_roundtrip_and_cosine() {
        let v = vec![1.0f32, -2.5, 3.125];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    struct CountingOracle {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl EmbeddingOracle for CountingOracle {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.is_some_and(|f| text.contains(f)) {
                return Err(OracleError::Rejected("nope".into()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn graph_with(names: &[&str]) -> Graph {
        let mut g = Graph::new();
        for name in names {
            g.upsert_entity(name, EntityType::Other, "d1", 1);
        }
        g
    }

    #[tokio::test]
    async fn refresh_only_embeds_stale_objects() {
        let oracle = Arc::new(CountingOracle {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let mut indexer = Indexer::default();
        let g = graph_with(&["login crash", "dark mode"]);
        let t = targets(&g, &[], true);

        let first = indexer
            .refresh(&t, oracle.clone(), Metric::Cosine, RetryPolicy::immediate(1), 2, &CancellationToken::new(), &NoProgress)
            .await;
        assert_eq!(first.embedded, 2);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);

        let g = graph_with(&["login crash", "dark mode", "offline mode"]);
        let t = targets(&g, &[], true);
        let second = indexer
            .refresh(&t, oracle.clone(), Metric::Cosine, RetryPolicy::immediate(1), 2, &CancellationToken::new(), &NoProgress)
            .await;
        assert_eq!(second.embedded, 1);
        assert_eq!(second.reused, 2);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
        assert_eq!(indexer.len(), 3);
    }

    #[tokio::test]
    async fn failed_object_is_excluded() {
        let oracle = Arc::new(CountingOracle {
            calls: AtomicUsize::new(0),
            fail_on: Some("dark"),
        });
        let mut indexer = Indexer::default();
        let g = graph_with(&["login crash", "dark mode"]);
        let outcome = indexer
            .refresh(
                &targets(&g, &[], true),
                oracle,
                Metric::Cosine,
                RetryPolicy::immediate(3),
                1,
                &CancellationToken::new(),
                &NoProgress,
            )
            .await;
        assert_eq!(outcome.embedded, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].owner_id, OwnerId::Entity(EntityId(1)));
        assert_eq!(outcome.failures[0].reason, ReasonCode::OracleRejected);
        let index = indexer.build_index().unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn flagged_communities_are_not_targets() {
        let g = graph_with(&["a"]);
        let communities = vec![
            Community {
                id: CommunityId(0),
                member_entity_ids: [EntityId(0)].into_iter().collect(),
                summary: "Summary generation failed.".into(),
                summary_hash: String::new(),
                flagged: true,
                miscellaneous: true,
            },
        ];
        assert_eq!(targets(&g, &communities, true).len(), 1);
    }
}
