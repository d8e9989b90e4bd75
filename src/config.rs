use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::community::Algorithm;
use crate::index::Metric;
use crate::oracle::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub community: CommunityConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/voc.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: default_corpus_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_corpus_root() -> PathBuf {
    PathBuf::from("./reviews")
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.txt".to_string(), "**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub chat_model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            chat_model: None,
            embedding_model: None,
            dims: None,
            url: None,
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String {
    "stub".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    32_000
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommunityConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_summary_entities")]
    pub max_summary_entities: usize,
    #[serde(default = "default_max_summary_relations")]
    pub max_summary_relations: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            seed: default_seed(),
            max_iterations: default_max_iterations(),
            max_summary_entities: default_max_summary_entities(),
            max_summary_relations: default_max_summary_relations(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

fn default_algorithm() -> String {
    "greedy_modularity".to_string()
}
fn default_seed() -> u64 {
    42
}
fn default_max_iterations() -> usize {
    100
}
fn default_max_summary_entities() -> usize {
    30
}
fn default_max_summary_relations() -> usize {
    20
}
fn default_max_prompt_chars() -> usize {
    6000
}

impl CommunityConfig {
    pub fn algorithm(&self) -> Result<Algorithm> {
        Algorithm::parse(&self.algorithm)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_true")]
    pub embed_communities: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            embed_communities: true,
        }
    }
}

fn default_metric() -> String {
    "cosine".to_string()
}
fn default_true() -> bool {
    true
}

impl IndexConfig {
    pub fn metric(&self) -> Result<Metric> {
        Metric::parse(&self.metric)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_source_documents")]
    pub max_source_documents: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
            max_source_documents: default_max_source_documents(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_max_context_chars() -> usize {
    8000
}
fn default_max_source_documents() -> usize {
    3
}

impl OracleConfig {
    pub fn is_network(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }

    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }

    if config.query.top_k == 0 {
        anyhow::bail!("query.top_k must be >= 1");
    }

    if config.query.max_context_chars == 0 {
        anyhow::bail!("query.max_context_chars must be > 0");
    }

    config
        .community
        .algorithm()
        .context("invalid community.algorithm")?;
    config.index.metric().context("invalid index.metric")?;

    match config.oracle.provider.as_str() {
        "openai" | "ollama" | "local" | "stub" => {}
        other => anyhow::bail!(
            "Unknown oracle provider: '{}'. Must be openai, ollama, local, or stub.",
            other
        ),
    }

    if config.oracle.is_network() {
        if config.oracle.dims.is_none() || config.oracle.dims == Some(0) {
            anyhow::bail!(
                "oracle.dims must be > 0 when provider is '{}'",
                config.oracle.provider
            );
        }
        if config.oracle.chat_model.is_none() || config.oracle.embedding_model.is_none() {
            anyhow::bail!(
                "oracle.chat_model and oracle.embedding_model must be specified when provider is '{}'",
                config.oracle.provider
            );
        }
    }

    if config.oracle.provider == "local" && config.oracle.chat_model.is_none() {
        anyhow::bail!("oracle.chat_model must be specified when provider is 'local'");
    }

    Ok(())
}
