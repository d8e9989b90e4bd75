//! Oracle capability interfaces and backends.
//!
//! The pipeline depends on three single-method capabilities:
//! - **[`StructureOracle`]**: review text → untyped `{entities, relationships}` JSON.
//! - **[`EmbeddingOracle`]**: text → fixed-length vector.
//! - **[`TextOracle`]**: prompt → text (summaries and answers).
//!
//! Backends:
//! - **[`OpenAiOracle`]**: OpenAI-compatible chat completions + embeddings API.
//! - **[`OllamaOracle`]**: a local Ollama instance (`/api/generate`, `/api/embed`).
//! - **`LocalEmbeddingOracle`**: fastembed, behind the `local-embeddings` feature.
//! - **[`StubOracle`]**: deterministic offline oracles (keyword extraction,
//!   hashed bag-of-words vectors, extractive text).
//!
//! # Retry Strategy
//!
//! Backends make exactly one request per call and classify failures:
//! - HTTP 429 (rate limited), 5xx and network errors → [`OracleError::Transient`]
//! - other HTTP 4xx → [`OracleError::Rejected`]
//! - unusable payload → [`OracleError::Malformed`]
//!
//! Call sites wrap invocations in [`RetryPolicy::run`], which retries only
//! transient failures with exponential backoff (`base`, `2×base`, `4×base`, …
//! capped at `max_delay`) up to `max_attempts` total attempts.

#[cfg(feature = "local-embeddings")]
mod local;
mod ollama;
mod openai;
pub mod prompts;
pub(crate) mod stub;

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbeddingOracle;
pub use ollama::OllamaOracle;
pub use openai::OpenAiOracle;
pub use stub::StubOracle;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::OracleConfig;
use crate::error::OracleError;

/// Text → structured extraction. The returned value is validated by
/// [`extract`](crate::extract::extract) before anything reaches the graph.
#[async_trait]
pub trait StructureOracle: Send + Sync {
    async fn extract_structure(&self, text: &str) -> Result<serde_json::Value, OracleError>;
}

/// Text → fixed-length vector. `dims` is constant for the process lifetime.
#[async_trait]
pub trait EmbeddingOracle: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError>;
}

/// Prompt → text. Used for community summaries and answer synthesis.
#[async_trait]
pub trait TextOracle: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, OracleError>;
}

/// The three oracles a pipeline runs against.
#[derive(Clone)]
pub struct Oracles {
    pub structure: Arc<dyn StructureOracle>,
    pub embedding: Arc<dyn EmbeddingOracle>,
    pub text: Arc<dyn TextOracle>,
}

/// Bounded exponential backoff for transient oracle failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps; useful for tests and local backends.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op`, retrying transient failures. Non-transient errors and the
    /// last transient error are returned unchanged.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, OracleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OracleError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient oracle failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Convert a JSON array of numbers into a vector. Any non-numeric
/// component makes the whole response malformed.
pub(crate) fn parse_vector(values: &[serde_json::Value]) -> Result<Vec<f32>, OracleError> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64().map(|x| x as f32).ok_or_else(|| {
                OracleError::Malformed(format!("non-numeric embedding component {}: {}", i, v))
            })
        })
        .collect()
}

/// Map a non-success HTTP status to an [`OracleError`].
pub(crate) fn classify_status(backend: &str, status: reqwest::StatusCode, body: String) -> OracleError {
    let message = format!("{} API error {}: {}", backend, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        OracleError::Transient(message)
    } else {
        OracleError::Rejected(message)
    }
}

/// Map a transport-level failure (connect, timeout, ...) to an [`OracleError`].
pub(crate) fn classify_transport(backend: &str, err: reqwest::Error) -> OracleError {
    if err.is_decode() {
        OracleError::Malformed(format!("{} response could not be decoded: {}", backend, err))
    } else {
        OracleError::Transient(format!("{} connection error: {}", backend, err))
    }
}

/// Create the oracles selected by `[oracle].provider`.
///
/// | Config Value | Structure / Text | Embedding |
/// |-------------|------------------|-----------|
/// | `"openai"` | [`OpenAiOracle`] | [`OpenAiOracle`] |
/// | `"ollama"` | [`OllamaOracle`] | [`OllamaOracle`] |
/// | `"local"` | [`OllamaOracle`] | `LocalEmbeddingOracle` (feature `local-embeddings`) |
/// | `"stub"` | [`StubOracle`] | [`StubOracle`] |
pub fn create_oracles(config: &OracleConfig) -> Result<Oracles> {
    match config.provider.as_str() {
        "openai" => {
            let oracle = Arc::new(OpenAiOracle::new(config)?);
            Ok(Oracles {
                structure: oracle.clone(),
                embedding: oracle.clone(),
                text: oracle,
            })
        }
        "ollama" => {
            let oracle = Arc::new(OllamaOracle::new(config)?);
            Ok(Oracles {
                structure: oracle.clone(),
                embedding: oracle.clone(),
                text: oracle,
            })
        }
        #[cfg(feature = "local-embeddings")]
        "local" => {
            let chat = Arc::new(OllamaOracle::new_chat_only(config)?);
            Ok(Oracles {
                structure: chat.clone(),
                embedding: Arc::new(LocalEmbeddingOracle::new(config)?),
                text: chat,
            })
        }
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        "stub" => {
            let oracle = Arc::new(StubOracle::new(config.dims.unwrap_or(stub::DEFAULT_DIMS)));
            Ok(Oracles {
                structure: oracle.clone(),
                embedding: oracle.clone(),
                text: oracle,
            })
        }
        other => bail!("Unknown oracle provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(30), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OracleError::Transient("429".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OracleError::Transient("timeout".into()))
            })
            .await;
        assert!(matches!(result, Err(OracleError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_rejections() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(5)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OracleError::Rejected("401".into()))
            })
            .await;
        assert!(matches!(result, Err(OracleError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classify_status_codes() {
        let e = classify_status("OpenAI", reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(e.is_transient());
        let e = classify_status("OpenAI", reqwest::StatusCode::BAD_GATEWAY, String::new());
        assert!(e.is_transient());
        let e = classify_status("OpenAI", reqwest::StatusCode::UNAUTHORIZED, String::new());
        assert!(matches!(e, OracleError::Rejected(_)));
    }

    #[test]
    fn stub_provider_is_created() {
        let config = OracleConfig::default();
        let oracles = create_oracles(&config).unwrap();
        assert_eq!(oracles.embedding.model_name(), "stub-hash-bow");
        assert_eq!(oracles.embedding.dims(), stub::DEFAULT_DIMS);
    }
}
