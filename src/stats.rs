//! Knowledge base statistics.
//!
//! Summarizes what the last saved build produced: entity counts per type,
//! relations, communities (and how many carry a placeholder summary),
//! embedding coverage, and the failures recorded by the last build. Used by
//! `voc stats`.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::store;

struct TypeStats {
    entity_type: String,
    entities: i64,
    mentions: i64,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::apply_schema(&pool).await?;

    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingested_documents")
        .fetch_one(&pool)
        .await?;
    let total_entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
        .fetch_one(&pool)
        .await?;
    let total_relations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relations")
        .fetch_one(&pool)
        .await?;
    let total_communities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM communities")
        .fetch_one(&pool)
        .await?;
    let flagged_communities: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM communities WHERE flagged = 1")
            .fetch_one(&pool)
            .await?;
    let embedded_entities: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE owner_kind = 'entity'")
            .fetch_one(&pool)
            .await?;
    let embedded_communities: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE owner_kind = 'community'")
            .fetch_one(&pool)
            .await?;
    let index_meta = sqlx::query("SELECT model, dims, metric FROM index_meta WHERE id = 1")
        .fetch_optional(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Review Graph: Database Stats");
    println!("============================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    if let Some(meta) = &index_meta {
        let model: String = meta.get("model");
        let dims: i64 = meta.get("dims");
        let metric: String = meta.get("metric");
        println!("  Index:        {} ({} dims, {})", model, dims, metric);
    }
    println!();
    println!("  Documents:    {}", total_docs);
    println!("  Entities:     {}", total_entities);
    println!("  Relations:    {}", total_relations);
    println!(
        "  Communities:  {} ({} with placeholder summary)",
        total_communities, flagged_communities
    );
    println!(
        "  Embedded:     {} / {} entities ({}%), {} communities",
        embedded_entities,
        total_entities,
        if total_entities > 0 {
            (embedded_entities * 100) / total_entities
        } else {
            0
        },
        embedded_communities
    );

    let type_rows = sqlx::query(
        r#"
        SELECT entity_type, COUNT(*) AS entities, SUM(mention_count) AS mentions
        FROM entities
        GROUP BY entity_type
        ORDER BY entities DESC, entity_type
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let type_stats: Vec<TypeStats> = type_rows
        .iter()
        .map(|row| TypeStats {
            entity_type: row.get("entity_type"),
            entities: row.get("entities"),
            mentions: row.get("mentions"),
        })
        .collect();

    if !type_stats.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<24} {:>8} {:>9}", "TYPE", "ENTITIES", "MENTIONS");
        println!("  {}", "-".repeat(43));
        for t in &type_stats {
            println!("  {:<24} {:>8} {:>9}", t.entity_type, t.entities, t.mentions);
        }
    }

    let failures = store::load_failures(&pool).await?;
    if !failures.is_empty() {
        println!();
        println!(
            "  Last build failures ({}, recorded {}):",
            failures.len(),
            format_ts_relative(failures[0].recorded_at)
        );
        println!("  {:<10} {:<24} {:<20} {}", "STAGE", "UNIT", "REASON", "MESSAGE");
        println!("  {}", "-".repeat(76));
        for f in &failures {
            println!("  {:<10} {:<24} {:<20} {}", f.stage, f.unit_id, f.reason, f.message);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
