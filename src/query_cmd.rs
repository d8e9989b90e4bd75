//! `voc query`: answer a question from the saved knowledge base.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::oracle;
use crate::query::{AnswerResult, QueryEngine, QueryOptions};
use crate::store;

pub async fn run_query(
    config: &Config,
    question: &str,
    k: Option<usize>,
    show_context: bool,
    json: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let Some(kb) = store::load_snapshot(&pool).await? else {
        bail!(
            "No knowledge base found in {}. Run `voc ingest` first.",
            config.db.path.display()
        );
    };
    pool.close().await;

    let oracles = oracle::create_oracles(&config.oracle)?;
    let engine = QueryEngine::new(
        Arc::new(kb),
        &oracles,
        config.index.metric()?,
        config.retry.policy(),
        QueryOptions::from(&config.query),
    )?;

    let answer = engine.answer_with_cancel(question, k, &cancel).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&to_json(&answer))?);
        return Ok(());
    }

    if show_context {
        eprintln!("{}", answer.context);
        eprintln!();
    }
    println!("{}", answer.text);
    if !answer.cited_sources.documents.is_empty() {
        println!();
        println!("Sources:");
        for document_id in &answer.cited_sources.documents {
            println!("  {}", document_id);
        }
    }
    Ok(())
}

fn to_json(answer: &AnswerResult) -> serde_json::Value {
    let hits: Vec<serde_json::Value> = answer
        .hits
        .iter()
        .map(|hit| {
            serde_json::json!({
                "owner": hit.owner_id.to_string(),
                "score": hit.score,
            })
        })
        .collect();
    serde_json::json!({
        "answer": answer.text,
        "cited_sources": answer.cited_sources,
        "hits": hits,
        "context": answer.context,
    })
}
