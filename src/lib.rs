//! # Voice-of-Customer Graph
//!
//! Turns a corpus of short user reviews into a queryable knowledge graph
//! and answers free-form questions over it (GraphRAG).
//!
//! Reviews are sent to a generative structure oracle that extracts typed
//! entities (bug reports, feature requests, sentiments, product
//! components) and relations. Extractions are merged into one
//! deduplicated graph, partitioned into communities that each get a
//! generated summary, and entities plus summaries are embedded into a
//! vector index. A question is answered by retrieving the nearest graph
//! objects, expanding them to their neighborhood and communities, and
//! asking the text oracle to answer from that context only.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐
//! │  Corpus  │──▶│  Extract  │──▶│ Assemble  │──▶│ Detect +  │
//! │ (files)  │   │ (oracle)  │   │  (graph)  │   │ Summarize │
//! └──────────┘   └───────────┘   └───────────┘   └─────┬─────┘
//!                                                      ▼
//!                ┌───────────┐   ┌───────────┐   ┌───────────┐
//!                │   Query   │◀──│  SQLite   │◀──│   Index   │
//!                │  Engine   │   │ snapshot  │   │ (embed)   │
//!                └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! voc init                              # create database
//! voc ingest                            # extract, assemble, summarize, embed
//! voc query "What bugs are reported?"
//! voc communities                       # inspect topic clusters
//! voc stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Failure taxonomy and reason codes |
//! | [`oracle`] | Structure / embedding / text oracle backends and retry |
//! | [`extract`] | Per-document structured extraction and validation |
//! | [`graph`] | Arena graph with normalization-key identity |
//! | [`assemble`] | Merging extractions into the graph |
//! | [`community`] | Community detection and summarization |
//! | [`index`] | Embedding staleness tracking and exact vector search |
//! | [`pipeline`] | Build orchestration over a bounded worker pool |
//! | [`query`] | GraphRAG question answering |
//! | [`corpus`] | Filesystem review loader |
//! | [`store`] | SQLite snapshot persistence |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod assemble;
pub mod community;
pub mod community_cmd;
pub mod config;
pub mod corpus;
pub mod db;
pub mod error;
pub mod export;
pub mod extract;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod oracle;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod query_cmd;
pub mod report;
pub mod stats;
pub mod store;

pub use graph::Graph;
pub use pipeline::{KnowledgeBase, Pipeline, PipelineOptions};
pub use query::{AnswerResult, QueryEngine, QueryOptions};
pub use report::BuildReport;
pub use tokio_util::sync::CancellationToken;
