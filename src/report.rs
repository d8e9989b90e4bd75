//! Aggregated outcome of one build run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{
    DanglingRelationWarning, EmbeddingFailure, ExtractionError, ReasonCode, SummarizationFailure,
};

/// Counts and contained failures of a build. Per-unit failures never abort
/// a build; they end up here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub documents_seen: usize,
    pub documents_ingested: usize,
    pub documents_skipped_empty: usize,
    pub documents_already_ingested: usize,
    pub entities_created: usize,
    pub entities_merged: usize,
    pub relations_created: usize,
    pub relations_merged: usize,
    pub communities: usize,
    pub summaries_generated: usize,
    pub summaries_reused: usize,
    pub embedded: usize,
    pub embeddings_reused: usize,
    pub embeddings_removed: usize,
    pub cancelled: bool,
    pub extraction_errors: Vec<ExtractionError>,
    pub dangling_relations: Vec<DanglingRelationWarning>,
    pub summarization_failures: Vec<SummarizationFailure>,
    pub embedding_failures: Vec<EmbeddingFailure>,
}

impl BuildReport {
    /// Number of contained failures (dangling relations are warnings and
    /// not counted).
    pub fn failure_count(&self) -> usize {
        self.extraction_errors.len()
            + self.summarization_failures.len()
            + self.embedding_failures.len()
    }

    pub fn reason_counts(&self) -> BTreeMap<ReasonCode, usize> {
        let mut counts = BTreeMap::new();
        let reasons = self
            .extraction_errors
            .iter()
            .map(|e| e.reason)
            .chain(self.summarization_failures.iter().map(|f| f.reason))
            .chain(self.embedding_failures.iter().map(|f| f.reason));
        for reason in reasons {
            *counts.entry(reason).or_insert(0) += 1;
        }
        counts
    }

    /// Print the report the way the other commands print summaries.
    pub fn print(&self) {
        println!(
            "Documents: {} seen, {} ingested, {} empty, {} already ingested",
            self.documents_seen,
            self.documents_ingested,
            self.documents_skipped_empty,
            self.documents_already_ingested
        );
        println!(
            "Entities:  {} created, {} merged",
            self.entities_created, self.entities_merged
        );
        println!(
            "Relations: {} created, {} merged, {} dropped (dangling)",
            self.relations_created,
            self.relations_merged,
            self.dangling_relations.len()
        );
        println!(
            "Communities: {} ({} summarized, {} reused)",
            self.communities, self.summaries_generated, self.summaries_reused
        );
        println!(
            "Embeddings: {} embedded, {} unchanged, {} removed",
            self.embedded, self.embeddings_reused, self.embeddings_removed
        );

        if self.failure_count() > 0 {
            println!("Failures: {}", self.failure_count());
            for (reason, count) in self.reason_counts() {
                println!("  {:<20} {}", reason, count);
            }
            for e in &self.extraction_errors {
                println!("  extract   {}  {}: {}", e.document_id, e.reason, e.message);
            }
            for f in &self.summarization_failures {
                println!("  summarize {}  {}: {}", f.community_id, f.reason, f.message);
            }
            for f in &self.embedding_failures {
                println!("  embed     {}  {}: {}", f.owner_id, f.reason, f.message);
            }
        }
        if self.cancelled {
            println!("Build cancelled before completion.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityId, OwnerId};

    #[test]
    fn counts_failures_by_reason() {
        let report = BuildReport {
            extraction_errors: vec![
                ExtractionError::new("d1", ReasonCode::EmptyStructure, "none"),
                ExtractionError::new("d2", ReasonCode::RetriesExhausted, "429"),
            ],
            embedding_failures: vec![EmbeddingFailure {
                owner_id: OwnerId::Entity(EntityId(0)),
                reason: ReasonCode::RetriesExhausted,
                message: "timeout".into(),
            }],
            ..BuildReport::default()
        };
        assert_eq!(report.failure_count(), 3);
        let counts = report.reason_counts();
        assert_eq!(counts[&ReasonCode::RetriesExhausted], 2);
        assert_eq!(counts[&ReasonCode::EmptyStructure], 1);
    }
}
