//! Core data models used throughout the review graph.
//!
//! These types represent the documents, entities, relations, communities and
//! embedding records that flow through extraction, assembly, community
//! detection, indexing and query answering.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of a document, assigned by the loader (e.g. a relative path).
pub type DocumentId = String;

/// Raw review supplied by the corpus loader. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Arena index of an [`Entity`] inside a [`Graph`](crate::graph::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

/// Arena index of a [`Relation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationId(pub u32);

/// Identifier of a [`Community`] within one detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommunityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Owner of an embedding record.
///
/// Ordering is entities first, then communities, each by numeric id. Search
/// ties are broken on this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OwnerId {
    Entity(EntityId),
    Community(CommunityId),
}

impl OwnerId {
    pub fn kind(&self) -> &'static str {
        match self {
            OwnerId::Entity(_) => "entity",
            OwnerId::Community(_) => "community",
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            OwnerId::Entity(id) => id.0,
            OwnerId::Community(id) => id.0,
        }
    }

    pub fn from_parts(kind: &str, raw: u32) -> Option<Self> {
        match kind {
            "entity" => Some(OwnerId::Entity(EntityId(raw))),
            "community" => Some(OwnerId::Community(CommunityId(raw))),
            _ => None,
        }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerId::Entity(id) => id.fmt(f),
            OwnerId::Community(id) => id.fmt(f),
        }
    }
}

/// Kind of thing a review talks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    FeatureRequest,
    BugReport,
    Sentiment,
    ProductComponent,
    Other,
}

impl EntityType {
    /// Lenient parse of the type labels generative backends produce
    /// (`BUG_REPORT`, `bug report`, `BugReport`, ...). Unknown labels map
    /// to [`EntityType::Other`].
    pub fn parse(label: &str) -> Self {
        let key: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "featurerequest" | "feature" | "request" => EntityType::FeatureRequest,
            "bugreport" | "bug" | "issue" => EntityType::BugReport,
            "sentiment" | "usersentiment" => EntityType::Sentiment,
            "productcomponent" | "component" => EntityType::ProductComponent,
            _ => EntityType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::FeatureRequest => "FEATURE_REQUEST",
            EntityType::BugReport => "BUG_REPORT",
            EntityType::Sentiment => "USER_SENTIMENT",
            EntityType::ProductComponent => "PRODUCT_COMPONENT",
            EntityType::Other => "OTHER",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of the knowledge graph.
///
/// Identity is `(normalized canonical_name, entity_type)`; see
/// [`normalize_name`]. Always has at least one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub mention_count: u64,
    pub source_document_ids: BTreeSet<DocumentId>,
}

impl Entity {
    /// Text handed to the embedding oracle for this entity.
    pub fn embedding_text(&self) -> String {
        format!("{} ({})", self.canonical_name, self.entity_type)
    }
}

/// A directed edge `subject -[predicate]-> object`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub subject: EntityId,
    pub predicate: String,
    pub object: EntityId,
    pub source_document_ids: BTreeSet<DocumentId>,
}

impl Relation {
    /// The endpoint opposite to `entity`, if `entity` is incident.
    pub fn other_endpoint(&self, entity: EntityId) -> Option<EntityId> {
        if self.subject == entity {
            Some(self.object)
        } else if self.object == entity {
            Some(self.subject)
        } else {
            None
        }
    }
}

/// A cluster of densely connected entities with its generated summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: CommunityId,
    pub member_entity_ids: BTreeSet<EntityId>,
    pub summary: String,
    /// Hash of the prompt `summary` was generated from. Empty until a
    /// summary is generated.
    #[serde(default)]
    pub summary_hash: String,
    /// Set when summarization failed and `summary` is a placeholder.
    #[serde(default)]
    pub flagged: bool,
    /// The bucket of isolated (degree 0) entities.
    #[serde(default)]
    pub miscellaneous: bool,
}

/// Embedding of one owned object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub owner_id: OwnerId,
    pub vector: Vec<f32>,
}

/// Entity proposed by the extractor, with an id scoped to one extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub local_id: String,
    pub name: String,
    pub entity_type: EntityType,
}

/// Relation proposed by the extractor between two local ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationCandidate {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// Validated output of extracting one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document_id: DocumentId,
    pub entities: Vec<EntityCandidate>,
    pub relations: Vec<RelationCandidate>,
}

/// Normalize an entity name for identity: lowercase, whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize a relation predicate: lowercase, whitespace collapsed to `_`.
pub fn normalize_predicate(predicate: &str) -> String {
    predicate
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_name("  Dark   Mode "), "dark mode");
        assert_eq!(normalize_name("LOGIN\tcrash"), "login crash");
        assert_eq!(normalize_name(""), "");
    }

    #[test]
    fn entity_type_parses_backend_labels() {
        assert_eq!(EntityType::parse("BUG_REPORT"), EntityType::BugReport);
        assert_eq!(EntityType::parse("Feature Request"), EntityType::FeatureRequest);
        assert_eq!(EntityType::parse("USER_SENTIMENT"), EntityType::Sentiment);
        assert_eq!(EntityType::parse("product_component"), EntityType::ProductComponent);
        assert_eq!(EntityType::parse("PERSON"), EntityType::Other);
    }

    #[test]
    fn owner_ordering_puts_entities_first() {
        let a = OwnerId::Entity(EntityId(9));
        let b = OwnerId::Community(CommunityId(0));
        assert!(a < b);
        assert!(OwnerId::Entity(EntityId(1)) < OwnerId::Entity(EntityId(2)));
        assert_eq!(OwnerId::from_parts(a.kind(), a.raw()), Some(a));
    }

    #[test]
    fn relation_other_endpoint() {
        let r = Relation {
            id: RelationId(0),
            subject: EntityId(1),
            predicate: "describes".into(),
            object: EntityId(2),
            source_document_ids: BTreeSet::new(),
        };
        assert_eq!(r.other_endpoint(EntityId(1)), Some(EntityId(2)));
        assert_eq!(r.other_endpoint(EntityId(2)), Some(EntityId(1)));
        assert_eq!(r.other_endpoint(EntityId(3)), None);
    }
}
