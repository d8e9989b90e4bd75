//! Snapshot persistence of a [`KnowledgeBase`] in SQLite.
//!
//! A snapshot is written as a whole inside one transaction: either the new
//! graph, communities and index state are all visible, or the previous
//! snapshot is. Vectors are stored as little-endian `f32` BLOBs next to the
//! content hash that produced them, so a reloaded indexer can still tell
//! which objects are stale.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::Graph;
use crate::index::{blob_to_vec, vec_to_blob, IndexEntry, Indexer, Metric};
use crate::migrate;
use crate::models::{
    Community, CommunityId, Document, Entity, EntityId, EntityType, OwnerId, Relation, RelationId,
};
use crate::pipeline::KnowledgeBase;
use crate::report::BuildReport;

/// A failure recorded by the last build.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFailure {
    pub stage: String,
    pub unit_id: String,
    pub reason: String,
    pub message: String,
    pub recorded_at: i64,
}

/// Replace the stored snapshot with `kb`. When `report` is given, its
/// failures replace the recorded ones.
pub async fn save_snapshot(
    pool: &SqlitePool,
    kb: &KnowledgeBase,
    report: Option<&BuildReport>,
) -> Result<()> {
    migrate::apply_schema(pool).await?;

    let mut tx = pool.begin().await?;
    for table in [
        "community_members",
        "communities",
        "relation_sources",
        "relations",
        "entity_sources",
        "entities",
        "ingested_documents",
        "documents",
        "embeddings",
        "index_meta",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }

    write_documents(&mut tx, kb).await?;
    write_graph(&mut tx, &kb.graph).await?;
    write_communities(&mut tx, &kb.communities).await?;
    write_index(&mut tx, &kb.indexer).await?;
    if let Some(report) = report {
        write_failures(&mut tx, report).await?;
    }

    tx.commit().await.context("Failed to commit snapshot")?;
    tracing::debug!(
        entities = kb.graph.entity_count(),
        relations = kb.graph.relation_count(),
        communities = kb.communities.len(),
        embeddings = kb.indexer.len(),
        "snapshot saved"
    );
    Ok(())
}

async fn write_documents(tx: &mut Transaction<'_, Sqlite>, kb: &KnowledgeBase) -> Result<()> {
    for document in kb.documents.values() {
        sqlx::query("INSERT INTO documents (id, text, metadata_json) VALUES (?, ?, ?)")
            .bind(&document.id)
            .bind(&document.text)
            .bind(serde_json::to_string(&document.metadata)?)
            .execute(&mut **tx)
            .await?;
    }
    for document_id in kb.graph.ingested_documents() {
        sqlx::query("INSERT INTO ingested_documents (document_id) VALUES (?)")
            .bind(document_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn write_graph(tx: &mut Transaction<'_, Sqlite>, graph: &Graph) -> Result<()> {
    for entity in graph.entities() {
        sqlx::query(
            "INSERT INTO entities (id, canonical_name, entity_type, mention_count) VALUES (?, ?, ?, ?)",
        )
        .bind(entity.id.0 as i64)
        .bind(&entity.canonical_name)
        .bind(entity.entity_type.as_str())
        .bind(entity.mention_count as i64)
        .execute(&mut **tx)
        .await?;
        for document_id in &entity.source_document_ids {
            sqlx::query("INSERT INTO entity_sources (entity_id, document_id) VALUES (?, ?)")
                .bind(entity.id.0 as i64)
                .bind(document_id)
                .execute(&mut **tx)
                .await?;
        }
    }

    for relation in graph.relations() {
        sqlx::query("INSERT INTO relations (id, subject_id, predicate, object_id) VALUES (?, ?, ?, ?)")
            .bind(relation.id.0 as i64)
            .bind(relation.subject.0 as i64)
            .bind(&relation.predicate)
            .bind(relation.object.0 as i64)
            .execute(&mut **tx)
            .await?;
        for document_id in &relation.source_document_ids {
            sqlx::query("INSERT INTO relation_sources (relation_id, document_id) VALUES (?, ?)")
                .bind(relation.id.0 as i64)
                .bind(document_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

async fn write_communities(tx: &mut Transaction<'_, Sqlite>, communities: &[Community]) -> Result<()> {
    for community in communities {
        sqlx::query(
            "INSERT INTO communities (id, summary, summary_hash, flagged, miscellaneous) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(community.id.0 as i64)
        .bind(&community.summary)
        .bind(&community.summary_hash)
        .bind(community.flagged)
        .bind(community.miscellaneous)
        .execute(&mut **tx)
        .await?;
        for member in &community.member_entity_ids {
            sqlx::query("INSERT INTO community_members (community_id, entity_id) VALUES (?, ?)")
                .bind(community.id.0 as i64)
                .bind(member.0 as i64)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

async fn write_index(tx: &mut Transaction<'_, Sqlite>, indexer: &Indexer) -> Result<()> {
    sqlx::query("INSERT INTO index_meta (id, model, dims, metric) VALUES (1, ?, ?, ?)")
        .bind(indexer.model())
        .bind(indexer.dims() as i64)
        .bind(indexer.metric().as_str())
        .execute(&mut **tx)
        .await?;
    for (owner_id, entry) in indexer.entries() {
        sqlx::query(
            "INSERT INTO embeddings (owner_kind, owner_id, content_hash, vector) VALUES (?, ?, ?, ?)",
        )
        .bind(owner_id.kind())
        .bind(owner_id.raw() as i64)
        .bind(&entry.content_hash)
        .bind(vec_to_blob(&entry.vector))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_failures(tx: &mut Transaction<'_, Sqlite>, report: &BuildReport) -> Result<()> {
    sqlx::query("DELETE FROM build_failures").execute(&mut **tx).await?;

    let now = Utc::now().timestamp();
    let rows = report
        .extraction_errors
        .iter()
        .map(|e| ("extract", e.document_id.clone(), e.reason, e.message.clone()))
        .chain(
            report
                .summarization_failures
                .iter()
                .map(|f| ("summarize", f.community_id.to_string(), f.reason, f.message.clone())),
        )
        .chain(
            report
                .embedding_failures
                .iter()
                .map(|f| ("embed", f.owner_id.to_string(), f.reason, f.message.clone())),
        );
    for (stage, unit_id, reason, message) in rows {
        sqlx::query(
            "INSERT INTO build_failures (stage, unit_id, reason, message, recorded_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(stage)
        .bind(unit_id)
        .bind(reason.as_str())
        .bind(message)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Load the stored snapshot, or `None` if nothing was saved yet.
pub async fn load_snapshot(pool: &SqlitePool) -> Result<Option<KnowledgeBase>> {
    migrate::apply_schema(pool).await?;

    let meta = sqlx::query("SELECT model, dims, metric FROM index_meta WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    let Some(meta) = meta else {
        return Ok(None);
    };

    let mut documents = BTreeMap::new();
    for row in sqlx::query("SELECT id, text, metadata_json FROM documents ORDER BY id")
        .fetch_all(pool)
        .await?
    {
        let metadata_json: String = row.get("metadata_json");
        let document = Document {
            id: row.get("id"),
            text: row.get("text"),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        };
        documents.insert(document.id.clone(), document);
    }

    let ingested: Vec<String> = sqlx::query_scalar("SELECT document_id FROM ingested_documents")
        .fetch_all(pool)
        .await?;
    let ingested: BTreeSet<String> = ingested.into_iter().collect();

    let graph = load_graph(pool, ingested).await?;
    let communities = load_communities(pool).await?;

    let metric: String = meta.get("metric");
    let dims: i64 = meta.get("dims");
    let mut entries = BTreeMap::new();
    for row in sqlx::query("SELECT owner_kind, owner_id, content_hash, vector FROM embeddings")
        .fetch_all(pool)
        .await?
    {
        let kind: String = row.get("owner_kind");
        let raw: i64 = row.get("owner_id");
        let Some(owner_id) = OwnerId::from_parts(&kind, raw as u32) else {
            bail!("unknown embedding owner kind '{}'", kind);
        };
        let blob: Vec<u8> = row.get("vector");
        entries.insert(
            owner_id,
            IndexEntry {
                content_hash: row.get("content_hash"),
                vector: blob_to_vec(&blob),
            },
        );
    }
    let indexer = Indexer::from_entries(
        meta.get::<String, _>("model"),
        dims as usize,
        Metric::parse(&metric)?,
        entries,
    );

    Ok(Some(KnowledgeBase {
        documents,
        graph,
        communities,
        indexer,
    }))
}

async fn load_graph(pool: &SqlitePool, ingested: BTreeSet<String>) -> Result<Graph> {
    let mut entity_sources: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
    for row in sqlx::query("SELECT entity_id, document_id FROM entity_sources")
        .fetch_all(pool)
        .await?
    {
        entity_sources
            .entry(row.get("entity_id"))
            .or_default()
            .insert(row.get("document_id"));
    }

    let mut entities = Vec::new();
    for row in sqlx::query(
        "SELECT id, canonical_name, entity_type, mention_count FROM entities ORDER BY id",
    )
    .fetch_all(pool)
    .await?
    {
        let id: i64 = row.get("id");
        let entity_type: String = row.get("entity_type");
        let mention_count: i64 = row.get("mention_count");
        entities.push(Entity {
            id: EntityId(id as u32),
            canonical_name: row.get("canonical_name"),
            entity_type: EntityType::parse(&entity_type),
            mention_count: mention_count as u64,
            source_document_ids: entity_sources.remove(&id).unwrap_or_default(),
        });
    }

    let mut relation_sources: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
    for row in sqlx::query("SELECT relation_id, document_id FROM relation_sources")
        .fetch_all(pool)
        .await?
    {
        relation_sources
            .entry(row.get("relation_id"))
            .or_default()
            .insert(row.get("document_id"));
    }

    let mut relations = Vec::new();
    for row in sqlx::query("SELECT id, subject_id, predicate, object_id FROM relations ORDER BY id")
        .fetch_all(pool)
        .await?
    {
        let id: i64 = row.get("id");
        let subject: i64 = row.get("subject_id");
        let object: i64 = row.get("object_id");
        relations.push(Relation {
            id: RelationId(id as u32),
            subject: EntityId(subject as u32),
            predicate: row.get("predicate"),
            object: EntityId(object as u32),
            source_document_ids: relation_sources.remove(&id).unwrap_or_default(),
        });
    }

    Graph::from_parts(entities, relations, ingested).context("Stored graph is inconsistent")
}

async fn load_communities(pool: &SqlitePool) -> Result<Vec<Community>> {
    let mut members: BTreeMap<i64, BTreeSet<EntityId>> = BTreeMap::new();
    for row in sqlx::query("SELECT community_id, entity_id FROM community_members")
        .fetch_all(pool)
        .await?
    {
        let entity_id: i64 = row.get("entity_id");
        members
            .entry(row.get("community_id"))
            .or_default()
            .insert(EntityId(entity_id as u32));
    }

    let mut communities = Vec::new();
    let rows = sqlx::query("SELECT id, summary, summary_hash, flagged, miscellaneous FROM communities ORDER BY id")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let id: i64 = row.get("id");
        communities.push(Community {
            id: CommunityId(id as u32),
            member_entity_ids: members.remove(&id).unwrap_or_default(),
            summary: row.get("summary"),
            summary_hash: row.get("summary_hash"),
            flagged: row.get("flagged"),
            miscellaneous: row.get("miscellaneous"),
        });
    }
    Ok(communities)
}

/// Failures recorded by the last saved build, in insertion order.
pub async fn load_failures(pool: &SqlitePool) -> Result<Vec<StoredFailure>> {
    migrate::apply_schema(pool).await?;
    let rows = sqlx::query("SELECT stage, unit_id, reason, message, recorded_at FROM build_failures ORDER BY rowid")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| StoredFailure {
            stage: row.get("stage"),
            unit_id: row.get("unit_id"),
            reason: row.get("reason"),
            message: row.get("message"),
            recorded_at: row.get("recorded_at"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::{ExtractionError, ReasonCode};
    use tempfile::TempDir;

    fn sample() -> KnowledgeBase {
        let mut graph = Graph::new();
        let (crash, _) = graph.upsert_entity("login crash", EntityType::BugReport, "d1", 2);
        let (login, _) = graph.upsert_entity("login", EntityType::ProductComponent, "d1", 1);
        graph.upsert_entity("login", EntityType::ProductComponent, "d2", 1);
        graph.upsert_relation(crash, "related_to", login, "d1");
        graph.mark_ingested("d1");
        graph.mark_ingested("d2");

        let mut documents = BTreeMap::new();
        documents.insert(
            "d1".to_string(),
            Document::new("d1", "App crashes on login").with_metadata("file_name", "d1.txt"),
        );
        documents.insert("d2".to_string(), Document::new("d2", "Login is slow"));

        let mut entries = BTreeMap::new();
        entries.insert(
            OwnerId::Entity(crash),
            IndexEntry {
                content_hash: "abc".into(),
                vector: vec![0.6, 0.8, 0.0],
            },
        );
        entries.insert(
            OwnerId::Community(CommunityId(0)),
            IndexEntry {
                content_hash: "def".into(),
                vector: vec![0.0, 0.0, 1.0],
            },
        );

        KnowledgeBase {
            documents,
            graph,
            communities: vec![Community {
                id: CommunityId(0),
                member_entity_ids: [crash, login].into_iter().collect(),
                summary: "Login crashes.".into(),
                summary_hash: "abc".into(),
                flagged: false,
                miscellaneous: false,
            }],
            indexer: Indexer::from_entries("stub-hash-bow", 3, Metric::Cosine, entries),
        }
    }

    #[tokio::test]
    async fn empty_database_has_no_snapshot() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("voc.sqlite")).await.unwrap();
        assert!(load_snapshot(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("voc.sqlite")).await.unwrap();
        let kb = sample();

        save_snapshot(&pool, &kb, None).await.unwrap();
        let loaded = load_snapshot(&pool).await.unwrap().unwrap();
        assert_eq!(loaded, kb);

        let login = loaded.graph.find_entity("login", EntityType::ProductComponent).unwrap();
        assert_eq!(loaded.graph.neighbors(login), kb.graph.neighbors(login));
        assert_eq!(
            loaded.index().unwrap().search(&[0.6, 0.8, 0.0], 2),
            kb.index().unwrap().search(&[0.6, 0.8, 0.0], 2)
        );
    }

    #[tokio::test]
    async fn saving_twice_replaces_the_snapshot() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("voc.sqlite")).await.unwrap();
        save_snapshot(&pool, &sample(), None).await.unwrap();
        save_snapshot(&pool, &KnowledgeBase::default(), None).await.unwrap();

        let loaded = load_snapshot(&pool).await.unwrap().unwrap();
        assert!(loaded.graph.is_empty());
        assert!(loaded.communities.is_empty());
    }

    #[tokio::test]
    async fn records_last_build_failures() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("voc.sqlite")).await.unwrap();
        let report = BuildReport {
            extraction_errors: vec![ExtractionError::new(
                "d2",
                ReasonCode::RetriesExhausted,
                "timeout",
            )],
            ..BuildReport::default()
        };
        save_snapshot(&pool, &sample(), Some(&report)).await.unwrap();

        let failures = load_failures(&pool).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stage, "extract");
        assert_eq!(failures[0].unit_id, "d2");
        assert_eq!(failures[0].reason, "retries_exhausted");
    }
}
