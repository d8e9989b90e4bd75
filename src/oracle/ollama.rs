//! Ollama backend: `POST /api/generate` for structure and text,
//! `POST /api/embed` for vectors.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::prompts::{extraction_prompt, locate_json};
use super::{
    classify_status, classify_transport, parse_vector, EmbeddingOracle, StructureOracle, TextOracle,
};
use crate::config::OracleConfig;
use crate::error::OracleError;

const BACKEND: &str = "Ollama";

/// Oracle backed by a running Ollama instance
/// (default `http://localhost:11434`).
pub struct OllamaOracle {
    client: reqwest::Client,
    url: String,
    chat_model: String,
    embedding_model: String,
    dims: usize,
    temperature: f32,
}

impl OllamaOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let mut oracle = Self::new_chat_only(config)?;
        oracle.embedding_model = config
            .embedding_model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("oracle.embedding_model required for Ollama provider"))?;
        oracle.dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("oracle.dims required for Ollama provider"))?;
        Ok(oracle)
    }

    /// Structure and text only; used when embeddings come from elsewhere.
    pub fn new_chat_only(config: &OracleConfig) -> Result<Self> {
        let chat_model = config
            .chat_model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("oracle.chat_model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            chat_model,
            embedding_model: String::new(),
            dims: 0,
            temperature: config.temperature,
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, OracleError> {
        let response = self
            .client
            .post(format!("{}{}", self.url, path))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                OracleError::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status(BACKEND, status, body_text));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| classify_transport(BACKEND, e))
    }

    async fn complete(&self, prompt: &str, json_mode: bool) -> Result<String, OracleError> {
        let mut body = serde_json::json!({
            "model": self.chat_model,
            "prompt": prompt,
            "stream": false,
            "options": {"temperature": self.temperature},
        });
        if json_mode {
            body["format"] = serde_json::json!("json");
        }

        let json = self.post("/api/generate", &body).await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| OracleError::Malformed("Invalid Ollama response: missing response".into()))
    }
}

#[async_trait]
impl StructureOracle for OllamaOracle {
    async fn extract_structure(&self, text: &str) -> Result<serde_json::Value, OracleError> {
        let content = self.complete(&extraction_prompt(text), true).await?;
        let json_text = locate_json(&content)
            .ok_or_else(|| OracleError::Malformed("no JSON object in Ollama response".into()))?;
        serde_json::from_str(json_text).map_err(|e| OracleError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TextOracle for OllamaOracle {
    async fn generate(&self, prompt: &str) -> Result<String, OracleError> {
        Ok(self.complete(prompt, false).await?.trim().to_string())
    }
}

#[async_trait]
impl EmbeddingOracle for OllamaOracle {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": [text],
        });
        let json = self.post("/api/embed", &body).await?;
        let vector = parse_embed_response(&json)?;
        if vector.len() != self.dims {
            return Err(OracleError::Malformed(format!(
                "expected {} dimensions, got {}",
                self.dims,
                vector.len()
            )));
        }
        Ok(vector)
    }
}

fn parse_embed_response(json: &serde_json::Value) -> Result<Vec<f32>, OracleError> {
    let first = json
        .get("embeddings")
        .and_then(|e| e.get(0))
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            OracleError::Malformed("Invalid Ollama response: missing embeddings array".into())
        })?;
    parse_vector(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_embedding() {
        let json = serde_json::json!({"model": "nomic-embed-text", "embeddings": [[0.25, 0.75]]});
        assert_eq!(parse_embed_response(&json).unwrap(), vec![0.25, 0.75]);
    }

    #[test]
    fn null_component_is_malformed() {
        let json = serde_json::json!({"embeddings": [[0.25, null]]});
        assert!(matches!(
            parse_embed_response(&json),
            Err(OracleError::Malformed(_))
        ));
    }

    #[test]
    fn chat_only_requires_chat_model() {
        let config = OracleConfig {
            provider: "ollama".into(),
            ..OracleConfig::default()
        };
        assert!(OllamaOracle::new_chat_only(&config).is_err());
    }
}
