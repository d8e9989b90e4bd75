//! Export the knowledge graph as JSON.
//!
//! Produces a document with every entity, relation and community of the
//! saved snapshot, for inspection or for loading into other graph tools.

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::models::{Community, Entity, Relation};
use crate::pipeline::KnowledgeBase;
use crate::store;

#[derive(Serialize)]
struct ExportData<'a> {
    documents: usize,
    index_model: &'a str,
    index_dims: usize,
    entities: &'a [Entity],
    relations: &'a [Relation],
    communities: &'a [Community],
}

/// Render `kb` as pretty JSON.
pub fn to_json(kb: &KnowledgeBase) -> Result<String> {
    let data = ExportData {
        documents: kb.graph.ingested_documents().len(),
        index_model: kb.indexer.model(),
        index_dims: kb.indexer.dims(),
        entities: kb.graph.entities(),
        relations: kb.graph.relations(),
        communities: &kb.communities,
    };
    Ok(serde_json::to_string_pretty(&data)?)
}

/// Export the saved snapshot.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, output: Option<&Path>) -> Result<()> {
    let pool = db::connect(config).await?;
    let Some(kb) = store::load_snapshot(&pool).await? else {
        bail!("No knowledge base found in {}. Run `voc ingest` first.", config.db.path.display());
    };
    pool.close().await;

    let json = to_json(&kb)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)?;
            eprintln!(
                "Exported {} entities, {} relations, {} communities to {}",
                kb.graph.entity_count(),
                kb.graph.relation_count(),
                kb.communities.len(),
                path.display()
            );
        }
        None => {
            println!("{}", json);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::models::EntityType;

    #[test]
    fn exports_entities_and_relations() {
        let mut graph = Graph::new();
        let (a, _) = graph.upsert_entity("login crash", EntityType::BugReport, "d1", 1);
        let (b, _) = graph.upsert_entity("login", EntityType::ProductComponent, "d1", 1);
        graph.upsert_relation(a, "related_to", b, "d1");
        graph.mark_ingested("d1");
        let kb = KnowledgeBase {
            graph,
            ..KnowledgeBase::default()
        };

        let value: serde_json::Value = serde_json::from_str(&to_json(&kb).unwrap()).unwrap();
        assert_eq!(value["documents"], 1);
        assert_eq!(value["entities"][0]["canonical_name"], "login crash");
        assert_eq!(value["entities"][0]["entity_type"], "BugReport");
        assert_eq!(value["relations"][0]["predicate"], "related_to");
        assert!(value["communities"].as_array().unwrap().is_empty());
    }
}
