//! OpenAI-compatible backend: `POST /v1/chat/completions` for structure and
//! text, `POST /v1/embeddings` for vectors.
//!
//! Requires the `OPENAI_API_KEY` environment variable. `[oracle].url`
//! overrides the base URL (default `https://api.openai.com`) so any
//! compatible gateway works.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use super::prompts::{extraction_prompt, locate_json};
use super::{
    classify_status, classify_transport, parse_vector, EmbeddingOracle, StructureOracle, TextOracle,
};
use crate::config::OracleConfig;
use crate::error::OracleError;

const BACKEND: &str = "OpenAI";

pub struct OpenAiOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    embedding_model: String,
    dims: usize,
    temperature: f32,
}

impl OpenAiOracle {
    /// # Errors
    ///
    /// Returns an error if the models or `dims` are not configured, or if
    /// `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let chat_model = config
            .chat_model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("oracle.chat_model required for OpenAI provider"))?;
        let embedding_model = config
            .embedding_model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("oracle.embedding_model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("oracle.dims required for OpenAI provider"))?;

        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            chat_model,
            embedding_model,
            dims,
            temperature: config.temperature,
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, OracleError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(BACKEND, e))?;

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

    async fn chat(&self, prompt: &str, json_mode: bool) -> Result<String, OracleError> {
        let mut body = serde_json::json!({
            "model": self.chat_model,
            "temperature": self.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });
        if json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let json = self.post("/v1/chat/completions", &body).await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String, OracleError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| OracleError::Malformed("missing choices[0].message.content".into()))
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>, OracleError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|d| d.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| OracleError::Malformed("missing data[0].embedding".into()))?;

    parse_vector(embedding)
}

#[async_trait]
impl StructureOracle for OpenAiOracle {
    async fn extract_structure(&self, text: &str) -> Result<serde_json::Value, OracleError> {
        let content = self.chat(&extraction_prompt(text), true).await?;
        let json_text = locate_json(&content)
            .ok_or_else(|| OracleError::Malformed("no JSON object in chat response".into()))?;
        serde_json::from_str(json_text).map_err(|e| OracleError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TextOracle for OpenAiOracle {
    async fn generate(&self, prompt: &str) -> Result<String, OracleError> {
        Ok(self.chat(prompt, false).await?.trim().to_string())
    }
}

#[async_trait]
impl EmbeddingOracle for OpenAiOracle {
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
        let json = self.post("/v1/embeddings", &body).await?;
        let vector = parse_embedding_response(&json)?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_content() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"entities\": []}"}}]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "{\"entities\": []}");
    }

    #[test]
    fn missing_content_is_malformed() {
        let json = serde_json::json!({"choices": []});
        assert!(matches!(
            parse_chat_response(&json),
            Err(OracleError::Malformed(_))
        ));
    }

    #[test]
    fn parses_embedding() {
        let json = serde_json::json!({"data": [{"index": 0, "embedding": [0.5, -1.0]}]});
        assert_eq!(parse_embedding_response(&json).unwrap(), vec![0.5, -1.0]);
    }

    #[test]
    fn non_numeric_embedding_is_malformed() {
        let json = serde_json::json!({"data": [{"index": 0, "embedding": [0.5, "NaN"]}]});
        assert!(matches!(
            parse_embedding_response(&json),
            Err(OracleError::Malformed(_))
        ));
    }
}
