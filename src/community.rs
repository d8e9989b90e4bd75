//! Community detection and summarization.
//!
//! Detection runs on the undirected projection of the graph (edge weight =
//! number of relations between a pair). Two algorithms are available:
//!
//! | `[community].algorithm` | Behavior |
//! |---|---|
//! | `greedy_modularity` (default) | Clauset–Newman–Moore agglomeration: repeatedly merge the pair of communities with the largest modularity gain while the gain is positive. Equal gains resolve to the lowest `(i, j)` pair. |
//! | `label_propagation` | Asynchronous label propagation in a seeded random order; a node keeps its label when it is among the heaviest, otherwise takes the lowest heaviest label. |
//!
//! Both are deterministic for a fixed graph (and seed). Every entity with
//! degree ≥ 1 lands in exactly one community. Isolated entities are grouped
//! into one extra community marked `miscellaneous`, which is summarized like
//! the others.
//!
//! Community ids are assigned in order of each community's lowest member
//! id, with the miscellaneous community last.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::CommunityConfig;
use crate::error::{ReasonCode, SummarizationFailure};
use crate::graph::Graph;
use crate::models::{Community, CommunityId, Entity, EntityId, Relation, RelationId};
use crate::oracle::{prompts, RetryPolicy, TextOracle};
use crate::progress::{BuildPhase, ProgressEvent, ProgressReporter};

/// Summary stored for a community whose summarization failed.
pub const PLACEHOLDER_SUMMARY: &str = "Summary generation failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    GreedyModularity,
    LabelPropagation,
}

impl Algorithm {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "greedy_modularity" => Ok(Algorithm::GreedyModularity),
            "label_propagation" => Ok(Algorithm::LabelPropagation),
            other => bail!(
                "Unknown community algorithm: '{}'. Must be greedy_modularity or label_propagation.",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::GreedyModularity => "greedy_modularity",
            Algorithm::LabelPropagation => "label_propagation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detector {
    pub algorithm: Algorithm,
    pub seed: u64,
    pub max_iterations: usize,
}

impl Default for Detector {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::GreedyModularity,
            seed: 42,
            max_iterations: 100,
        }
    }
}

impl Detector {
    pub fn from_config(config: &CommunityConfig) -> Result<Self> {
        Ok(Self {
            algorithm: config.algorithm()?,
            seed: config.seed,
            max_iterations: config.max_iterations,
        })
    }
}

/// Partition `graph` into communities. Summaries are left empty.
pub fn detect(graph: &Graph, detector: &Detector) -> Vec<Community> {
    let edges = graph.undirected_edges();
    let nodes: Vec<EntityId> = edges
        .keys()
        .flat_map(|&(u, v)| [u, v])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut groups = match detector.algorithm {
        Algorithm::GreedyModularity => greedy_modularity(&nodes, &edges),
        Algorithm::LabelPropagation => {
            label_propagation(&nodes, &edges, detector.seed, detector.max_iterations)
        }
    };
    for group in &mut groups {
        group.sort();
    }
    groups.sort_by_key(|g| g.first().copied());

    let connected: BTreeSet<EntityId> = nodes.into_iter().collect();
    let isolated: BTreeSet<EntityId> = graph
        .entities()
        .iter()
        .map(|e| e.id)
        .filter(|id| !connected.contains(id))
        .collect();

    let mut communities: Vec<Community> = groups
        .into_iter()
        .enumerate()
        .map(|(i, members)| Community {
            id: CommunityId(i as u32),
            member_entity_ids: members.into_iter().collect(),
            summary: String::new(),
            summary_hash: String::new(),
            flagged: false,
            miscellaneous: false,
        })
        .collect();

    if !isolated.is_empty() {
        communities.push(Community {
            id: CommunityId(communities.len() as u32),
            member_entity_ids: isolated,
            summary: String::new(),
            summary_hash: String::new(),
            flagged: false,
            miscellaneous: true,
        });
    }

    tracing::debug!(
        algorithm = detector.algorithm.as_str(),
        communities = communities.len(),
        "community detection finished"
    );
    communities
}

fn greedy_modularity(
    nodes: &[EntityId],
    edges: &BTreeMap<(EntityId, EntityId), f64>,
) -> Vec<Vec<EntityId>> {
    let n = nodes.len();
    let index: HashMap<EntityId, usize> = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let total: f64 = edges.values().sum();
    if total <= 0.0 {
        return nodes.iter().map(|&id| vec![id]).collect();
    }
    let two_m = 2.0 * total;

    // e[i][j]: fraction of edge ends joining communities i and j; a[i]: fraction
    // of edge ends attached to community i.
    let mut e: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
    let mut a = vec![0.0f64; n];
    for (&(u, v), &w) in edges {
        let (i, j) = (index[&u], index[&v]);
        let f = w / two_m;
        *e[i].entry(j).or_insert(0.0) += f;
        *e[j].entry(i).or_insert(0.0) += f;
        a[i] += f;
        a[j] += f;
    }

    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut alive = vec![true; n];

    loop {
        let mut best: Option<(f64, usize, usize)> = None;
        for i in (0..n).filter(|&i| alive[i]) {
            for (&j, &eij) in e[i].range(i + 1..) {
                let gain = 2.0 * (eij - a[i] * a[j]);
                if best.map_or(true, |(b, _, _)| gain > b) {
                    best = Some((gain, i, j));
                }
            }
        }
        let Some((gain, i, j)) = best else { break };
        if gain <= 0.0 {
            break;
        }

        // Merge j into i.
        let row = std::mem::take(&mut e[j]);
        for (k, ejk) in row {
            if k == i {
                continue;
            }
            e[k].remove(&j);
            *e[k].entry(i).or_insert(0.0) += ejk;
            *e[i].entry(k).or_insert(0.0) += ejk;
        }
        e[i].remove(&j);
        a[i] += a[j];
        a[j] = 0.0;
        let moved = std::mem::take(&mut members[j]);
        members[i].extend(moved);
        alive[j] = false;
    }

    (0..n)
        .filter(|&i| alive[i])
        .map(|i| members[i].iter().map(|&k| nodes[k]).collect())
        .collect()
}

fn label_propagation(
    nodes: &[EntityId],
    edges: &BTreeMap<(EntityId, EntityId), f64>,
    seed: u64,
    max_iterations: usize,
) -> Vec<Vec<EntityId>> {
    let n = nodes.len();
    let index: HashMap<EntityId, usize> = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    for (&(u, v), &w) in edges {
        let (i, j) = (index[&u], index[&v]);
        adjacency[i].push((j, w));
        adjacency[j].push((i, w));
    }

    let mut labels: Vec<usize> = (0..n).collect();
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);

    for _ in 0..max_iterations.max(1) {
        order.shuffle(&mut rng);
        let mut changed = false;
        for &v in &order {
            let mut weights: BTreeMap<usize, f64> = BTreeMap::new();
            for &(u, w) in &adjacency[v] {
                *weights.entry(labels[u]).or_insert(0.0) += w;
            }
            let heaviest = weights.values().copied().fold(f64::MIN, f64::max);
            if weights.get(&labels[v]).is_some_and(|&w| w >= heaviest) {
                continue;
            }
            if let Some((&label, _)) = weights.iter().find(|(_, &w)| w >= heaviest) {
                labels[v] = label;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut groups: BTreeMap<usize, Vec<EntityId>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(nodes[i]);
    }
    groups.into_values().collect()
}

/// Map each entity to the community containing it.
pub fn membership(communities: &[Community]) -> HashMap<EntityId, CommunityId> {
    communities
        .iter()
        .flat_map(|c| c.member_entity_ids.iter().map(move |&e| (e, c.id)))
        .collect()
}

/// Hash of a summary prompt, used to tell whether a stored summary still
/// describes its community.
pub fn prompt_hash(prompt: &str) -> String {
    format!("{:x}", Sha256::digest(prompt.as_bytes()))
}

/// Reuse summaries of `previous` communities whose summary prompt over the
/// current `graph` is unchanged. New relations or renamed members inside a
/// community change its prompt, so its summary is generated again. Flagged
/// (placeholder) summaries are never reused. Returns how many were carried
/// over.
pub fn carry_over_summaries(
    communities: &mut [Community],
    previous: &[Community],
    graph: &Graph,
    options: &SummaryOptions,
) -> usize {
    let by_prompt: HashMap<&str, &Community> = previous
        .iter()
        .filter(|c| !c.flagged && !c.summary.is_empty() && !c.summary_hash.is_empty())
        .map(|c| (c.summary_hash.as_str(), c))
        .collect();

    let mut reused = 0;
    for community in communities.iter_mut() {
        let hash = prompt_hash(&summary_prompt(community, graph, options));
        if let Some(old) = by_prompt.get(hash.as_str()) {
            community.summary = old.summary.clone();
            community.summary_hash = hash;
            reused += 1;
        }
    }
    reused
}

/// Bounds for a summary prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryOptions {
    pub max_entities: usize,
    pub max_relations: usize,
    pub max_prompt_chars: usize,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            max_entities: 30,
            max_relations: 20,
            max_prompt_chars: 6000,
        }
    }
}

impl From<&CommunityConfig> for SummaryOptions {
    fn from(config: &CommunityConfig) -> Self {
        Self {
            max_entities: config.max_summary_entities,
            max_relations: config.max_summary_relations,
            max_prompt_chars: config.max_prompt_chars,
        }
    }
}

/// Build the summary prompt for `community`.
///
/// Members are taken by highest `mention_count` (then id); relations of the
/// induced subgraph by number of source documents (then id). Lines are then
/// dropped from the end, relations first, until the prompt fits
/// `max_prompt_chars`. At least one entity line is always kept.
pub fn summary_prompt(community: &Community, graph: &Graph, options: &SummaryOptions) -> String {
    let mut members: Vec<&Entity> = community
        .member_entity_ids
        .iter()
        .filter_map(|&id| graph.entity(id))
        .collect();
    members.sort_by(|a, b| b.mention_count.cmp(&a.mention_count).then(a.id.cmp(&b.id)));
    members.truncate(options.max_entities.max(1));

    let relation_ids: BTreeSet<RelationId> = community
        .member_entity_ids
        .iter()
        .flat_map(|&id| graph.incident_relations(id).iter().copied())
        .collect();
    let mut relations: Vec<&Relation> = relation_ids
        .into_iter()
        .filter_map(|rid| graph.relation(rid))
        .filter(|r| {
            r.subject != r.object
                && community.member_entity_ids.contains(&r.subject)
                && community.member_entity_ids.contains(&r.object)
        })
        .collect();
    relations.sort_by(|a, b| {
        b.source_document_ids
            .len()
            .cmp(&a.source_document_ids.len())
            .then(a.id.cmp(&b.id))
    });
    relations.truncate(options.max_relations);

    let mut entity_lines: Vec<String> = members
        .iter()
        .map(|e| format!("- Entity: {} (Type: {})", e.canonical_name, e.entity_type))
        .collect();
    let mut relation_lines: Vec<String> = relations
        .iter()
        .filter_map(|r| {
            let subject = graph.entity(r.subject)?;
            let object = graph.entity(r.object)?;
            Some(format!(
                "- {} -[{}]-> {}",
                subject.canonical_name, r.predicate, object.canonical_name
            ))
        })
        .collect();

    loop {
        let prompt = prompts::summary_prompt(&entity_lines, &relation_lines);
        if prompt.len() <= options.max_prompt_chars {
            return prompt;
        }
        if relation_lines.pop().is_some() {
            continue;
        }
        if entity_lines.len() > 1 {
            entity_lines.pop();
            continue;
        }
        return prompt;
    }
}

/// Summarize one community.
pub async fn summarize(
    community: &Community,
    graph: &Graph,
    oracle: &dyn TextOracle,
    retry: &RetryPolicy,
    options: &SummaryOptions,
) -> Result<String, SummarizationFailure> {
    let prompt = summary_prompt(community, graph, options);
    request_summary(community.id, &prompt, oracle, retry).await
}

async fn request_summary(
    community_id: CommunityId,
    prompt: &str,
    oracle: &dyn TextOracle,
    retry: &RetryPolicy,
) -> Result<String, SummarizationFailure> {
    match retry.run("summarize", || oracle.generate(prompt)).await {
        Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Ok(_) => Err(SummarizationFailure {
            community_id,
            reason: ReasonCode::MalformedResponse,
            message: "empty summary".to_string(),
        }),
        Err(e) => Err(SummarizationFailure {
            community_id,
            reason: ReasonCode::for_oracle(&e),
            message: e.to_string(),
        }),
    }
}

#[derive(Debug, Default)]
pub struct SummarizeOutcome {
    pub summarized: usize,
    pub failures: Vec<SummarizationFailure>,
    pub cancelled: bool,
}

/// Summarize every community whose summary is still empty or flagged, with
/// at most `workers` oracle calls in flight.
///
/// A failed community gets [`PLACEHOLDER_SUMMARY`] and `flagged = true`, so
/// the next build tries it again. When cancelled, communities not yet
/// started keep their previous summary.
#[allow(clippy::too_many_arguments)]
pub async fn summarize_all(
    communities: &mut [Community],
    graph: &Graph,
    oracle: Arc<dyn TextOracle>,
    retry: RetryPolicy,
    options: &SummaryOptions,
    workers: usize,
    cancel: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> SummarizeOutcome {
    let mut outcome = SummarizeOutcome::default();
    let pending: Vec<usize> = communities
        .iter()
        .enumerate()
        .filter(|(_, c)| c.summary.is_empty() || c.flagged)
        .map(|(i, _)| i)
        .collect();
    let total = pending.len() as u64;
    if pending.is_empty() {
        return outcome;
    }

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    for &i in &pending {
        let prompt = summary_prompt(&communities[i], graph, options);
        let hash = prompt_hash(&prompt);
        let community_id = communities[i].id;
        let oracle = oracle.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (i, hash, None);
            };
            if cancel.is_cancelled() {
                return (i, hash, None);
            }
            let result = request_summary(community_id, &prompt, oracle.as_ref(), &retry).await;
            (i, hash, Some(result))
        });
    }

    let mut done = 0u64;
    let mut finished = BTreeSet::new();
    while let Some(joined) = tasks.join_next().await {
        let (i, hash, result) = match joined {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "summary task failed");
                continue;
            }
        };
        let community = &mut communities[i];
        match result {
            Some(Ok(summary)) => {
                community.summary = summary;
                community.summary_hash = hash;
                community.flagged = false;
                outcome.summarized += 1;
                finished.insert(i);
            }
            Some(Err(failure)) => {
                tracing::warn!(community_id = %failure.community_id, reason = %failure.reason, "{}", failure.message);
                community.summary = PLACEHOLDER_SUMMARY.to_string();
                community.summary_hash.clear();
                community.flagged = true;
                outcome.failures.push(failure);
                finished.insert(i);
            }
            None => outcome.cancelled = true,
        }
        done += 1;
        progress.report(ProgressEvent {
            phase: BuildPhase::Summarize,
            n: done,
            total,
        });
    }

    if !outcome.cancelled {
        for &i in pending.iter().filter(|i| !finished.contains(*i)) {
            let community = &mut communities[i];
            community.summary = PLACEHOLDER_SUMMARY.to_string();
            community.summary_hash.clear();
            community.flagged = true;
            outcome.failures.push(SummarizationFailure {
                community_id: community.id,
                reason: ReasonCode::MalformedResponse,
                message: "summary task did not complete".to_string(),
            });
        }
    }

    outcome.failures.sort_by_key(|f| f.community_id);
    outcome
}
