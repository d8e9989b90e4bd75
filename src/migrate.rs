//! Schema for the persisted knowledge base.
//!
//! Every statement is `CREATE ... IF NOT EXISTS`, so `voc init` can be run
//! repeatedly and the snapshot store can apply the schema before writing.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        id INTEGER PRIMARY KEY,
        canonical_name TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        mention_count INTEGER NOT NULL,
        UNIQUE(canonical_name, entity_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entity_sources (
        entity_id INTEGER NOT NULL,
        document_id TEXT NOT NULL,
        PRIMARY KEY (entity_id, document_id),
        FOREIGN KEY (entity_id) REFERENCES entities(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS relations (
        id INTEGER PRIMARY KEY,
        subject_id INTEGER NOT NULL,
        predicate TEXT NOT NULL,
        object_id INTEGER NOT NULL,
        UNIQUE(subject_id, predicate, object_id),
        FOREIGN KEY (subject_id) REFERENCES entities(id),
        FOREIGN KEY (object_id) REFERENCES entities(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS relation_sources (
        relation_id INTEGER NOT NULL,
        document_id TEXT NOT NULL,
        PRIMARY KEY (relation_id, document_id),
        FOREIGN KEY (relation_id) REFERENCES relations(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingested_documents (
        document_id TEXT PRIMARY KEY
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS communities (
        id INTEGER PRIMARY KEY,
        summary TEXT NOT NULL,
        summary_hash TEXT NOT NULL DEFAULT '',
        flagged INTEGER NOT NULL DEFAULT 0,
        miscellaneous INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS community_members (
        community_id INTEGER NOT NULL,
        entity_id INTEGER NOT NULL,
        PRIMARY KEY (community_id, entity_id),
        FOREIGN KEY (community_id) REFERENCES communities(id),
        FOREIGN KEY (entity_id) REFERENCES entities(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        owner_kind TEXT NOT NULL,
        owner_id INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        vector BLOB NOT NULL,
        PRIMARY KEY (owner_kind, owner_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        metric TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS build_failures (
        stage TEXT NOT NULL,
        unit_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        message TEXT NOT NULL,
        recorded_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_entity_sources_doc ON entity_sources(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_community_members_entity ON community_members(entity_id)",
];

/// Create every table and index on an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
