//! `voc ingest`: load the corpus, extend the knowledge base, save it.
//!
//! The stored snapshot is extended in place (append-only): documents whose
//! id is already in the graph are skipped, communities are re-detected when
//! new documents were merged, and only stale embeddings are recomputed.
//! `--full` starts from an empty knowledge base instead.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::corpus;
use crate::db;
use crate::oracle;
use crate::pipeline::{KnowledgeBase, Pipeline, PipelineOptions};
use crate::progress::ProgressMode;
use crate::store;

pub async fn run_ingest(
    config: &Config,
    full: bool,
    dry_run: bool,
    limit: Option<usize>,
    progress: ProgressMode,
    cancel: CancellationToken,
) -> Result<()> {
    let mut documents = corpus::load_documents(&config.corpus)?;
    if let Some(lim) = limit {
        documents.truncate(lim);
    }

    let pool = db::connect(config).await?;
    let mut kb = if full {
        KnowledgeBase::new()
    } else {
        store::load_snapshot(&pool).await?.unwrap_or_default()
    };

    if dry_run {
        let pending = documents
            .iter()
            .filter(|d| !kb.graph.is_ingested(&d.id) && !d.text.trim().is_empty())
            .count();
        println!("ingest (dry-run)");
        println!("  corpus root:        {}", config.corpus.root.display());
        println!("  documents found:    {}", documents.len());
        println!("  already ingested:   {}", kb.graph.ingested_documents().len());
        println!("  to extract:         {}", pending);
        pool.close().await;
        return Ok(());
    }

    let oracles = oracle::create_oracles(&config.oracle)?;
    let options = PipelineOptions::from_config(config)?;
    let pipeline = Pipeline::new(oracles, options)
        .with_cancel(cancel)
        .with_progress(Arc::from(progress.reporter()));

    tracing::info!(
        documents = documents.len(),
        full,
        provider = %config.oracle.provider,
        "ingest started"
    );
    let report = pipeline.build(&mut kb, documents).await;

    println!("ingest");
    report.print();

    if report.cancelled {
        pool.close().await;
        bail!("Ingest cancelled; the stored knowledge base was left unchanged.");
    }

    store::save_snapshot(&pool, &kb, Some(&report)).await?;
    println!(
        "Saved {} entities, {} relations, {} communities to {}",
        kb.graph.entity_count(),
        kb.graph.relation_count(),
        kb.communities.len(),
        config.db.path.display()
    );

    pool.close().await;
    Ok(())
}
