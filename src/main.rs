//! # Review Graph CLI (`voc`)
//!
//! ## Usage
//!
//! ```bash
//! voc --config ./config/voc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `voc init` | Create the SQLite database and schema |
//! | `voc ingest` | Extract, assemble, summarize and embed new reviews |
//! | `voc query "<question>"` | Answer a question from the knowledge base |
//! | `voc communities` | List communities and their summaries |
//! | `voc stats` | Print knowledge base statistics |
//! | `voc export` | Dump the graph and communities as JSON |

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use voc_graph::progress::ProgressMode;
use voc_graph::{
    community_cmd, config, export, ingest, migrate, query_cmd, stats, CancellationToken,
};

/// Review Graph CLI: build a knowledge graph from user reviews and ask it
/// questions.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/voc.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "voc",
    about = "Build a knowledge graph from user reviews and answer questions over it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/voc.toml")]
    config: PathBuf,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest reviews from the configured corpus.
    ///
    /// Extends the stored knowledge base with documents it has not seen,
    /// re-detects and summarizes communities, and embeds stale objects.
    Ingest {
        /// Discard the stored knowledge base and rebuild from scratch.
        #[arg(long)]
        full: bool,

        /// Show document counts without calling any oracle.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of documents to read from the corpus.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress output: `auto`, `human`, `json` or `off` (stderr).
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Answer a question from the knowledge base.
    Query {
        /// The question.
        question: String,

        /// Number of graph objects to retrieve (defaults to `[query].top_k`).
        #[arg(long, short)]
        k: Option<usize>,

        /// Print the retrieved context to stderr before the answer.
        #[arg(long)]
        show_context: bool,

        /// Print the answer, cited sources and hits as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List communities with their members and summaries.
    Communities,

    /// Show knowledge base statistics.
    Stats,

    /// Export the graph and communities as JSON.
    Export {
        /// Output file path. Writes to stdout if omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("voc=debug,voc_graph=debug")
        } else {
            EnvFilter::new("voc=info,voc_graph=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight work");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            full,
            dry_run,
            limit,
            progress,
        } => {
            let mode = match progress.as_str() {
                "auto" => ProgressMode::default_for_tty(),
                other => match ProgressMode::parse(other) {
                    Some(mode) => mode,
                    None => bail!(
                        "Unknown progress mode: '{}'. Must be auto, human, json, or off.",
                        other
                    ),
                },
            };
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            ingest::run_ingest(&cfg, full, dry_run, limit, mode, cancel).await?;
        }
        Commands::Query {
            question,
            k,
            show_context,
            json,
        } => {
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            query_cmd::run_query(&cfg, &question, k, show_context, json, cancel).await?;
        }
        Commands::Communities => {
            community_cmd::run_communities(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Export { output } => {
            export::run_export(&cfg, output.as_deref()).await?;
        }
    }

    Ok(())
}
