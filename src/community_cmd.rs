//! `voc communities`: list detected communities with their summaries.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::pipeline::KnowledgeBase;
use crate::store;

/// Lines printed for one knowledge base. Members are listed by descending
/// mention count.
pub fn render(kb: &KnowledgeBase) -> Vec<String> {
    let mut lines = Vec::new();
    for community in &kb.communities {
        let mut members: Vec<_> = community
            .member_entity_ids
            .iter()
            .filter_map(|id| kb.graph.entity(*id))
            .collect();
        members.sort_by(|a, b| b.mention_count.cmp(&a.mention_count).then(a.id.cmp(&b.id)));

        let mut header = format!("{} ({} members)", community.id, members.len());
        if community.miscellaneous {
            header.push_str(" [miscellaneous]");
        }
        if community.flagged {
            header.push_str(" [summary failed]");
        }
        lines.push(header);
        lines.push(format!("  summary: {}", community.summary));
        for entity in members {
            lines.push(format!(
                "  - {} ({}, {} mention{})",
                entity.canonical_name,
                entity.entity_type,
                entity.mention_count,
                if entity.mention_count == 1 { "" } else { "s" }
            ));
        }
    }
    lines
}

pub async fn run_communities(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let Some(kb) = store::load_snapshot(&pool).await? else {
        bail!("No knowledge base found in {}. Run `voc ingest` first.", config.db.path.display());
    };
    pool.close().await;

    if kb.communities.is_empty() {
        println!("No communities.");
        return Ok(());
    }
    for line in render(&kb) {
        println!("{}", line);
    }
    Ok(())
}
