//! Arena-backed knowledge graph.
//!
//! Entities and relations live in two `Vec`s indexed by their integer ids.
//! Side indexes map normalization keys to ids and each entity to its
//! incident relations. The graph is only mutated through
//! [`assemble`](crate::assemble), which runs on a single writer.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{
    normalize_name, normalize_predicate, DocumentId, Entity, EntityId, EntityType, Relation,
    RelationId,
};

type EntityKey = (String, EntityType);
type RelationKey = (EntityId, String, EntityId);

#[derive(Debug, Clone, Default)]
pub struct Graph {
    entities: Vec<Entity>,
    relations: Vec<Relation>,
    entity_keys: HashMap<EntityKey, EntityId>,
    relation_keys: HashMap<RelationKey, RelationId>,
    incident: Vec<Vec<RelationId>>,
    ingested: BTreeSet<DocumentId>,
}

/// Graphs are equal when their arenas and ingested sets are; the side
/// indexes are derived.
impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.entities == other.entities
            && self.relations == other.relations
            && self.ingested == other.ingested
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from persisted parts. Ids must be dense (`0..n`) and
    /// every relation endpoint must exist.
    pub fn from_parts(
        entities: Vec<Entity>,
        relations: Vec<Relation>,
        ingested: BTreeSet<DocumentId>,
    ) -> Result<Self> {
        let mut graph = Graph {
            ingested,
            ..Graph::default()
        };

        for (i, entity) in entities.into_iter().enumerate() {
            if entity.id.0 as usize != i {
                bail!("entity ids are not dense: expected e{}, found {}", i, entity.id);
            }
            let key = (normalize_name(&entity.canonical_name), entity.entity_type);
            if graph.entity_keys.insert(key, entity.id).is_some() {
                bail!("duplicate entity key for {}", entity.id);
            }
            graph.entities.push(entity);
            graph.incident.push(Vec::new());
        }

        for (i, relation) in relations.into_iter().enumerate() {
            if relation.id.0 as usize != i {
                bail!("relation ids are not dense: expected r{}, found {}", i, relation.id);
            }
            if graph.entity(relation.subject).is_none() || graph.entity(relation.object).is_none() {
                bail!("relation {} has a dangling endpoint", relation.id);
            }
            graph.index_relation(&relation);
            graph.relations.push(relation);
        }

        Ok(graph)
    }

    fn index_relation(&mut self, relation: &Relation) {
        self.relation_keys.insert(
            (relation.subject, relation.predicate.clone(), relation.object),
            relation.id,
        );
        self.incident[relation.subject.0 as usize].push(relation.id);
        if relation.object != relation.subject {
            self.incident[relation.object.0 as usize].push(relation.id);
        }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id.0 as usize)
    }

    pub fn relation(&self, id: RelationId) -> Option<&Relation> {
        self.relations.get(id.0 as usize)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up an entity by its identity (name is normalized first).
    pub fn find_entity(&self, name: &str, entity_type: EntityType) -> Option<EntityId> {
        self.entity_keys
            .get(&(normalize_name(name), entity_type))
            .copied()
    }

    /// Look up or create the entity for `(name, entity_type)`, adding
    /// `mentions` and `document_id` to it.
    pub(crate) fn upsert_entity(
        &mut self,
        name: &str,
        entity_type: EntityType,
        document_id: &str,
        mentions: u64,
    ) -> (EntityId, bool) {
        let key = (normalize_name(name), entity_type);
        if let Some(&id) = self.entity_keys.get(&key) {
            let entity = &mut self.entities[id.0 as usize];
            entity.mention_count += mentions;
            entity.source_document_ids.insert(document_id.to_string());
            return (id, false);
        }

        let id = EntityId(self.entities.len() as u32);
        self.entities.push(Entity {
            id,
            canonical_name: key.0.clone(),
            entity_type,
            mention_count: mentions,
            source_document_ids: BTreeSet::from([document_id.to_string()]),
        });
        self.incident.push(Vec::new());
        self.entity_keys.insert(key, id);
        (id, true)
    }

    /// Look up or create the relation `subject -[predicate]-> object`.
    /// Both endpoints must already exist.
    pub(crate) fn upsert_relation(
        &mut self,
        subject: EntityId,
        predicate: &str,
        object: EntityId,
        document_id: &str,
    ) -> (RelationId, bool) {
        let key = (subject, normalize_predicate(predicate), object);
        if let Some(&id) = self.relation_keys.get(&key) {
            self.relations[id.0 as usize]
                .source_document_ids
                .insert(document_id.to_string());
            return (id, false);
        }

        let relation = Relation {
            id: RelationId(self.relations.len() as u32),
            subject,
            predicate: key.1,
            object,
            source_document_ids: BTreeSet::from([document_id.to_string()]),
        };
        let id = relation.id;
        self.index_relation(&relation);
        self.relations.push(relation);
        (id, true)
    }

    /// Relations incident to `id`, in creation order.
    pub fn incident_relations(&self, id: EntityId) -> &[RelationId] {
        self.incident
            .get(id.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 1-hop neighborhood of `id` as `(relation, other endpoint)` pairs.
    /// Self-loops are not neighbors.
    pub fn neighbors(&self, id: EntityId) -> Vec<(RelationId, EntityId)> {
        self.incident_relations(id)
            .iter()
            .filter_map(|&rid| {
                let relation = &self.relations[rid.0 as usize];
                relation
                    .other_endpoint(id)
                    .filter(|&other| other != id)
                    .map(|other| (rid, other))
            })
            .collect()
    }

    /// Number of distinct neighbors in the undirected projection.
    pub fn degree(&self, id: EntityId) -> usize {
        self.neighbors(id)
            .into_iter()
            .map(|(_, other)| other)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Undirected projection: `(low, high) → number of relations` between
    /// the pair. Self-loops are omitted.
    pub fn undirected_edges(&self) -> BTreeMap<(EntityId, EntityId), f64> {
        let mut edges = BTreeMap::new();
        for relation in &self.relations {
            if relation.subject == relation.object {
                continue;
            }
            let key = if relation.subject < relation.object {
                (relation.subject, relation.object)
            } else {
                (relation.object, relation.subject)
            };
            *edges.entry(key).or_insert(0.0) += 1.0;
        }
        edges
    }

    pub fn is_ingested(&self, document_id: &str) -> bool {
        self.ingested.contains(document_id)
    }

    pub(crate) fn mark_ingested(&mut self, document_id: &str) {
        self.ingested.insert(document_id.to_string());
    }

    pub fn ingested_documents(&self) -> &BTreeSet<DocumentId> {
        &self.ingested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_merges_by_normalized_key() {
        let mut g = Graph::new();
        let (a, created) = g.upsert_entity("Dark  Mode", EntityType::FeatureRequest, "d1", 1);
        assert!(created);
        let (b, created) = g.upsert_entity("dark mode", EntityType::FeatureRequest, "d2", 1);
        assert!(!created);
        assert_eq!(a, b);
        let e = g.entity(a).unwrap();
        assert_eq!(e.canonical_name, "dark mode");
        assert_eq!(e.mention_count, 2);
        assert_eq!(e.source_document_ids.len(), 2);

        let (c, _) = g.upsert_entity("dark mode", EntityType::BugReport, "d1", 1);
        assert_ne!(a, c);
    }

    #[test]
    fn neighbors_and_degree() {
        let mut g = Graph::new();
        let (a, _) = g.upsert_entity("login crash", EntityType::BugReport, "d1", 1);
        let (b, _) = g.upsert_entity("login", EntityType::ProductComponent, "d1", 1);
        let (c, _) = g.upsert_entity("negative", EntityType::Sentiment, "d1", 1);
        g.upsert_relation(a, "related to", b, "d1");
        g.upsert_relation(c, "describes", a, "d1");
        let (_, created) = g.upsert_relation(a, "Related   To", b, "d2");
        assert!(!created);

        assert_eq!(g.relation_count(), 2);
        assert_eq!(g.degree(a), 2);
        assert_eq!(g.degree(b), 1);
        let others: Vec<EntityId> = g.neighbors(a).into_iter().map(|(_, e)| e).collect();
        assert_eq!(others, vec![b, c]);
        assert_eq!(g.relation(RelationId(0)).unwrap().predicate, "related_to");
    }

    #[test]
    fn self_loops_are_not_edges() {
        let mut g = Graph::new();
        let (a, _) = g.upsert_entity("x", EntityType::Other, "d1", 1);
        g.upsert_relation(a, "mentions", a, "d1");
        assert_eq!(g.degree(a), 0);
        assert!(g.undirected_edges().is_empty());
    }

    #[test]
    fn from_parts_rebuilds_indexes() {
        let mut g = Graph::new();
        let (a, _) = g.upsert_entity("login crash", EntityType::BugReport, "d1", 3);
        let (b, _) = g.upsert_entity("login", EntityType::ProductComponent, "d1", 1);
        g.upsert_relation(a, "related_to", b, "d1");
        g.mark_ingested("d1");

        let rebuilt = Graph::from_parts(
            g.entities().to_vec(),
            g.relations().to_vec(),
            g.ingested_documents().clone(),
        )
        .unwrap();
        assert_eq!(rebuilt, g);
        assert_eq!(rebuilt.neighbors(a), g.neighbors(a));
        assert_eq!(rebuilt.find_entity("LOGIN CRASH", EntityType::BugReport), Some(a));
    }

    #[test]
    fn from_parts_rejects_dangling() {
        let mut g = Graph::new();
        let (a, _) = g.upsert_entity("x", EntityType::Other, "d1", 1);
        let (b, _) = g.upsert_entity("y", EntityType::Other, "d1", 1);
        g.upsert_relation(a, "r", b, "d1");
        let entities = g.entities()[..1].to_vec();
        assert!(Graph::from_parts(entities, g.relations().to_vec(), BTreeSet::new()).is_err());
    }
}
