//! Local embeddings through fastembed. Models are downloaded on first use
//! from Hugging Face and cached; no network calls afterwards.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::EmbeddingOracle;
use crate::config::OracleConfig;
use crate::error::OracleError;

pub struct LocalEmbeddingOracle {
    model_name: String,
    dims: usize,
    model: Arc<Mutex<fastembed::TextEmbedding>>,
}

impl LocalEmbeddingOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let model_name = config
            .embedding_model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });

        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(to_fastembed_model(&model_name)?)
                .with_show_download_progress(true),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims,
            model: Arc::new(Mutex::new(model)),
        })
    }
}

fn to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5",
            other
        ),
    }
}

#[async_trait]
impl EmbeddingOracle for LocalEmbeddingOracle {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        let model = self.model.clone();
        let text = text.to_string();

        let embeddings = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| OracleError::Rejected("local embedding model poisoned".into()))?;
            model
                .embed(vec![text], None)
                .map_err(|e| OracleError::Rejected(format!("Local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| OracleError::Rejected(format!("embedding task panicked: {}", e)))??;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| OracleError::Malformed("empty embedding response".into()))
    }
}
