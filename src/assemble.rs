//! Graph assembly: merging validated extraction results into a [`Graph`].
//!
//! Entities merge on `(normalized name, type)`, summing mention counts and
//! unioning source documents. Relation endpoints are resolved through the
//! local ids of the same extraction; a relation with an unresolved endpoint
//! is dropped with a [`DanglingRelationWarning`].
//!
//! Each document id is merged at most once per graph. Re-assembling a batch
//! therefore leaves the graph unchanged, while new documents extend it.

use std::collections::HashMap;

use crate::error::DanglingRelationWarning;
use crate::graph::Graph;
use crate::models::{EntityId, ExtractionResult};

/// What one [`merge`] call did to the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// The document was already part of the graph; nothing changed.
    pub already_ingested: bool,
    pub entities_created: usize,
    pub entities_merged: usize,
    pub relations_created: usize,
    pub relations_merged: usize,
    pub dangling: Vec<DanglingRelationWarning>,
}

/// Merge one extraction result into `graph`.
pub fn merge(graph: &mut Graph, result: &ExtractionResult) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    if graph.is_ingested(&result.document_id) {
        outcome.already_ingested = true;
        return outcome;
    }

    let document_id = result.document_id.as_str();
    let mut local: HashMap<&str, EntityId> = HashMap::with_capacity(result.entities.len());

    for candidate in &result.entities {
        let (id, created) =
            graph.upsert_entity(&candidate.name, candidate.entity_type, document_id, 1);
        if created {
            outcome.entities_created += 1;
        } else {
            outcome.entities_merged += 1;
        }
        local.insert(candidate.local_id.as_str(), id);
    }

    for candidate in &result.relations {
        let subject = local.get(candidate.subject.as_str()).copied();
        let object = local.get(candidate.object.as_str()).copied();
        let (subject, object) = match (subject, object) {
            (Some(s), Some(o)) => (s, o),
            (s, _) => {
                let missing = if s.is_none() {
                    candidate.subject.clone()
                } else {
                    candidate.object.clone()
                };
                let warning = DanglingRelationWarning {
                    document_id: document_id.to_string(),
                    subject: candidate.subject.clone(),
                    predicate: candidate.predicate.clone(),
                    object: candidate.object.clone(),
                    missing,
                };
                tracing::warn!(document_id, "{}", warning);
                outcome.dangling.push(warning);
                continue;
            }
        };

        let (_, created) = graph.upsert_relation(subject, &candidate.predicate, object, document_id);
        if created {
            outcome.relations_created += 1;
        } else {
            outcome.relations_merged += 1;
        }
    }

    graph.mark_ingested(document_id);
    tracing::debug!(
        document_id,
        entities_created = outcome.entities_created,
        relations_created = outcome.relations_created,
        "merged extraction"
    );
    outcome
}

/// Merge a whole batch into `graph`, in batch order. Returns the dangling
/// relation warnings of the batch.
pub fn assemble_into(graph: &mut Graph, batch: &[ExtractionResult]) -> Vec<DanglingRelationWarning> {
    batch
        .iter()
        .flat_map(|result| merge(graph, result).dangling)
        .collect()
}

/// Assemble a fresh graph from `batch`.
pub fn assemble(batch: &[ExtractionResult]) -> Graph {
    let mut graph = Graph::new();
    assemble_into(&mut graph, batch);
    graph
}
