//! Deterministic offline oracles.
//!
//! - structure: keyword rules over each sentence (bug terms, wish phrases,
//!   a small product-component lexicon, sentiment words)
//! - embedding: signed hashed bag-of-words over stemmed tokens, L2-normalized
//! - text: extractive, echoes the listed items of the prompt
//!
//! Output depends only on the input text, so whole pipelines can be run and
//! asserted on without a generative backend.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::{EmbeddingOracle, StructureOracle, TextOracle};
use crate::error::OracleError;

pub const DEFAULT_DIMS: usize = 256;
const MODEL_NAME: &str = "stub-hash-bow";

const BUG_TERMS: &[(&str, &str)] = &[
    ("crash", "crash"),
    ("crashes", "crash"),
    ("crashed", "crash"),
    ("crashing", "crash"),
    ("freeze", "freeze"),
    ("freezes", "freeze"),
    ("frozen", "freeze"),
    ("bug", "bug"),
    ("buggy", "bug"),
    ("error", "error"),
    ("errors", "error"),
    ("broken", "failure"),
    ("fails", "failure"),
    ("glitch", "glitch"),
    ("laggy", "lag"),
    ("lag", "lag"),
    ("slow", "slowness"),
];

const COMPONENTS: &[&str] = &[
    "login",
    "playlist",
    "search",
    "ui",
    "notifications",
    "sync",
    "payment",
    "ads",
    "update",
    "settings",
    "offline",
    "player",
    "library",
    "account",
    "checkout",
    "camera",
];

const FEATURE_TRIGGERS: &[&str] = &[
    "would love",
    "would like",
    "i wish",
    "please add",
    "should add",
    "want a",
    "need a",
];

const FILLER: &[&str] = &[
    "a", "an", "the", "to", "be", "able", "option", "feature", "there", "was", "were", "for",
    "some", "more", "please", "add", "have", "of", "it", "is",
];

const POSITIVE: &[&str] = &[
    "great", "awesome", "amazing", "excellent", "good", "best", "fantastic", "nice", "perfect",
];
const NEGATIVE: &[&str] = &[
    "terrible", "hate", "awful", "bad", "worst", "annoying", "frustrating", "useless", "horrible",
    "disappointed",
];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "what", "which", "who", "how", "do", "does",
    "of", "to", "in", "on", "and", "or", "for", "it", "this", "that", "any", "there", "be",
];

pub struct StubOracle {
    dims: usize,
}

impl StubOracle {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.replace('\'', "").to_ascii_lowercase())
        .collect()
}

fn slug(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}

#[derive(Default)]
struct Extracted {
    entities: BTreeMap<String, (String, &'static str)>,
    relations: Vec<(String, String, &'static str)>,
}

impl Extracted {
    fn entity(&mut self, prefix: &str, name: &str, entity_type: &'static str) -> String {
        let id = format!("{}_{}", prefix, slug(name));
        self.entities
            .entry(id.clone())
            .or_insert_with(|| (name.to_string(), entity_type));
        id
    }

    fn relate(&mut self, source: &str, target: &str, predicate: &'static str) {
        let rel = (source.to_string(), target.to_string(), predicate);
        if !self.relations.contains(&rel) {
            self.relations.push(rel);
        }
    }
}

fn feature_name(sentence: &str) -> Option<String> {
    let lower = sentence.to_ascii_lowercase();
    let (pos, trigger) = FEATURE_TRIGGERS
        .iter()
        .filter_map(|t| lower.find(t).map(|p| (p, *t)))
        .min()?;
    let rest = words(&lower[pos + trigger.len()..]);
    let kept: Vec<String> = rest
        .into_iter()
        .skip_while(|w| FILLER.contains(&w.as_str()))
        .take_while(|w| !FILLER.contains(&w.as_str()))
        .take(3)
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join(" "))
    }
}

fn extract_review(text: &str) -> Extracted {
    let mut out = Extracted::default();
    let mut positive = 0usize;
    let mut negative = 0usize;
    let mut topics = Vec::new();

    for sentence in text.split(['.', '!', '?', '\n']) {
        let tokens = words(sentence);
        if tokens.is_empty() {
            continue;
        }
        positive += tokens.iter().filter(|t| POSITIVE.contains(&t.as_str())).count();
        negative += tokens.iter().filter(|t| NEGATIVE.contains(&t.as_str())).count();

        let component = tokens
            .iter()
            .find(|t| COMPONENTS.contains(&t.as_str()))
            .map(|c| c.to_string());
        let component_id = component
            .as_deref()
            .map(|c| out.entity("component", c, "PRODUCT_COMPONENT"));

        let bug = tokens
            .iter()
            .find_map(|t| BUG_TERMS.iter().find(|(term, _)| term == t).map(|(_, kind)| *kind));
        if let Some(kind) = bug {
            let name = format!("{} {}", component.as_deref().unwrap_or("app"), kind);
            let bug_id = out.entity("bug", &name, "BUG_REPORT");
            if let Some(cid) = &component_id {
                out.relate(&bug_id, cid, "related_to");
            }
            topics.push(bug_id);
        }

        if let Some(name) = feature_name(sentence) {
            let feature_id = out.entity("feature", &name, "FEATURE_REQUEST");
            if let Some(cid) = &component_id {
                out.relate(&feature_id, cid, "related_to");
            }
            topics.push(feature_id);
        }
    }

    let sentiment = match (positive, negative) {
        (0, 0) => None,
        (p, 0) if p > 0 => Some("positive"),
        (0, n) if n > 0 => Some("negative"),
        _ => Some("mixed"),
    };
    if let Some(label) = sentiment {
        let sentiment_id = out.entity("sentiment", label, "USER_SENTIMENT");
        for topic in topics {
            out.relate(&sentiment_id, &topic, "describes");
        }
    }

    out
}

fn stem(word: &str) -> String {
    let mut w = word.to_string();
    if w.len() > 4 && w.ends_with("ies") {
        w.truncate(w.len() - 3);
        w.push('y');
    } else if w.len() > 4
        && (w.ends_with("shes") || w.ends_with("ches") || w.ends_with("xes") || w.ends_with("sses"))
    {
        w.truncate(w.len() - 2);
    } else if w.len() > 3 && w.ends_with('s') && !w.ends_with("ss") {
        w.truncate(w.len() - 1);
    }
    if w.len() > 5 && w.ends_with("ing") {
        w.truncate(w.len() - 3);
    } else if w.len() > 4 && w.ends_with("ed") {
        w.truncate(w.len() - 2);
    }
    w
}

/// Signed feature-hashing of stemmed, stopword-filtered tokens.
pub(crate) fn hashed_bow(text: &str, dims: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dims];
    for token in words(&text.replace('_', " ")) {
        if STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        let digest = Sha256::digest(stem(&token).as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[async_trait]
impl StructureOracle for StubOracle {
    async fn extract_structure(&self, text: &str) -> Result<serde_json::Value, OracleError> {
        let extracted = extract_review(text);
        let entities: Vec<serde_json::Value> = extracted
            .entities
            .iter()
            .map(|(id, (name, entity_type))| {
                serde_json::json!({"id": id, "type": entity_type, "value": name})
            })
            .collect();
        let relationships: Vec<serde_json::Value> = extracted
            .relations
            .iter()
            .map(|(source, target, predicate)| {
                serde_json::json!({"source": source, "target": target, "type": predicate})
            })
            .collect();
        Ok(serde_json::json!({"entities": entities, "relationships": relationships}))
    }
}

#[async_trait]
impl EmbeddingOracle for StubOracle {
    fn model_name(&self) -> &str {
        MODEL_NAME
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        Ok(hashed_bow(text, self.dims))
    }
}

#[async_trait]
impl TextOracle for StubOracle {
    async fn generate(&self, prompt: &str) -> Result<String, OracleError> {
        let mut items: Vec<&str> = Vec::new();
        for line in prompt.lines().map(str::trim) {
            let item = line
                .strip_prefix("- Entity: ")
                .or_else(|| line.strip_prefix("Entity "));
            if let Some(item) = item {
                if !items.contains(&item) {
                    items.push(item);
                }
            }
            if items.len() == 5 {
                break;
            }
        }

        if items.is_empty() {
            return Ok("No notable topics.".to_string());
        }
        Ok(format!("Reviews mention: {}.", items.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(value: &serde_json::Value) -> Vec<(String, String)> {
        value["entities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| {
                (
                    e["value"].as_str().unwrap().to_string(),
                    e["type"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn extracts_bug_with_component() {
        let oracle = StubOracle::new(DEFAULT_DIMS);
        let value = oracle
            .extract_structure("App crashes on login, please fix")
            .await
            .unwrap();
        let found = names(&value);
        assert!(found.contains(&("login crash".to_string(), "BUG_REPORT".to_string())));
        assert!(found.contains(&("login".to_string(), "PRODUCT_COMPONENT".to_string())));
        assert_eq!(value["relationships"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extracts_feature_request() {
        let oracle = StubOracle::new(DEFAULT_DIMS);
        let value = oracle
            .extract_structure("Would love a dark mode option")
            .await
            .unwrap();
        assert_eq!(
            names(&value),
            vec![("dark mode".to_string(), "FEATURE_REQUEST".to_string())]
        );
    }

    #[tokio::test]
    async fn sentiment_describes_topics() {
        let oracle = StubOracle::new(DEFAULT_DIMS);
        let value = oracle
            .extract_structure("Terrible update. The playlist freezes all the time.")
            .await
            .unwrap();
        let found = names(&value);
        assert!(found.contains(&("negative".to_string(), "USER_SENTIMENT".to_string())));
        assert!(found.contains(&("playlist freeze".to_string(), "BUG_REPORT".to_string())));
        let rels = value["relationships"].as_array().unwrap();
        assert!(rels.iter().any(|r| r["type"] == "describes"));
    }

    #[tokio::test]
    async fn embedding_is_deterministic_and_normalized() {
        let oracle = StubOracle::new(64);
        let a = oracle.embed("login crash (BUG_REPORT)").await.unwrap();
        let b = oracle.embed("login crash (BUG_REPORT)").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn stemming_aligns_question_and_type_label() {
        assert_eq!(stem("bugs"), "bug");
        assert_eq!(stem("reported"), "report");
        assert_eq!(stem("crashes"), "crash");
        assert_eq!(stem("login"), "login");
    }

    #[tokio::test]
    async fn text_echoes_entities() {
        let oracle = StubOracle::new(8);
        let out = oracle
            .generate("Entities:\n- Entity: dark mode (Type: FEATURE_REQUEST)\n\nSummary:\n")
            .await
            .unwrap();
        assert_eq!(out, "Reviews mention: dark mode (Type: FEATURE_REQUEST).");
    }
}
