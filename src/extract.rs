//! Entity-relation extraction for one document.
//!
//! The structure oracle is called once per attempt (transient failures are
//! retried by the [`RetryPolicy`]) and its untyped JSON is validated here,
//! at the boundary, into an [`ExtractionResult`]. Nothing untyped travels
//! further into the graph.
//!
//! Accepted shape (keys in parentheses are accepted aliases):
//!
//! ```json
//! {
//!   "entities":      [{"id": "..", "type": "BUG_REPORT", "value" (name): ".."}],
//!   "relationships" (relations): [{"source" (subject): "..", "target" (object): "..", "type" (predicate): ".."}]
//! }
//! ```
//!
//! Individual invalid candidates are dropped with a warning; a response with
//! the wrong top-level shape is a `schema_violation`, and a response with no
//! valid entity for a non-empty document is `empty_structure`.

use serde_json::Value;
use std::collections::HashSet;

use crate::error::{ExtractionError, ReasonCode};
use crate::models::{Document, EntityCandidate, EntityType, ExtractionResult, RelationCandidate};
use crate::oracle::{RetryPolicy, StructureOracle};

/// Extract candidates from `document`.
///
/// Returns `Ok(None)` for documents whose text is empty or whitespace;
/// those are skipped, not failed.
pub async fn extract(
    document: &Document,
    oracle: &dyn StructureOracle,
    retry: &RetryPolicy,
) -> Result<Option<ExtractionResult>, ExtractionError> {
    if document.text.trim().is_empty() {
        tracing::debug!(document_id = %document.id, "skipping empty document");
        return Ok(None);
    }

    let value = retry
        .run("extract", || oracle.extract_structure(&document.text))
        .await
        .map_err(|e| ExtractionError::new(&document.id, ReasonCode::for_oracle(&e), e.to_string()))?;

    validate(&document.id, &value).map(Some)
}

fn array_field<'a>(
    document_id: &str,
    object: &'a serde_json::Map<String, Value>,
    keys: &[&str],
) -> Result<&'a [Value], ExtractionError> {
    match keys.iter().find_map(|k| object.get(*k)) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(other) => Err(ExtractionError::new(
            document_id,
            ReasonCode::SchemaViolation,
            format!("'{}' must be an array, got {}", keys[0], type_name(other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A string field, or a number rendered as a string (some models emit
/// numeric ids).
fn str_field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match item.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Validate raw oracle output for `document_id`.
pub fn validate(document_id: &str, value: &Value) -> Result<ExtractionResult, ExtractionError> {
    let object = value.as_object().ok_or_else(|| {
        ExtractionError::new(
            document_id,
            ReasonCode::SchemaViolation,
            format!("expected a JSON object, got {}", type_name(value)),
        )
    })?;

    let raw_entities = array_field(document_id, object, &["entities"])?;
    let raw_relations = array_field(document_id, object, &["relationships", "relations"])?;

    let mut seen = HashSet::new();
    let mut entities = Vec::with_capacity(raw_entities.len());
    for (i, item) in raw_entities.iter().enumerate() {
        let Some(name) = str_field(item, &["value", "name"]) else {
            tracing::warn!(document_id, index = i, "dropping entity without a name");
            continue;
        };
        let local_id = str_field(item, &["id"]).unwrap_or_else(|| name.clone());
        if !seen.insert(local_id.clone()) {
            tracing::warn!(document_id, local_id = %local_id, "dropping entity with duplicate id");
            continue;
        }
        let entity_type = str_field(item, &["type", "entity_type"])
            .map(|t| EntityType::parse(&t))
            .unwrap_or(EntityType::Other);
        entities.push(EntityCandidate {
            local_id,
            name,
            entity_type,
        });
    }

    if entities.is_empty() {
        return Err(ExtractionError::new(
            document_id,
            ReasonCode::EmptyStructure,
            format!(
                "no valid entities in response ({} proposed)",
                raw_entities.len()
            ),
        ));
    }

    let mut relations = Vec::with_capacity(raw_relations.len());
    for (i, item) in raw_relations.iter().enumerate() {
        let subject = str_field(item, &["source", "subject"]);
        let object = str_field(item, &["target", "object"]);
        match (subject, object) {
            (Some(subject), Some(object)) => relations.push(RelationCandidate {
                subject,
                predicate: str_field(item, &["type", "predicate", "relation"])
                    .unwrap_or_else(|| "related_to".to_string()),
                object,
            }),
            _ => tracing::warn!(document_id, index = i, "dropping relation without endpoints"),
        }
    }

    Ok(ExtractionResult {
        document_id: document_id.to_string(),
        entities,
        relations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        error: OracleError,
        value: Value,
    }

    #[async_trait]
    impl StructureOracle for Scripted {
        async fn extract_structure(&self, _text: &str) -> Result<Value, OracleError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(self.value.clone())
            }
        }
    }

    fn scripted(fail_first: u32, error: OracleError, value: Value) -> Scripted {
        Scripted {
            calls: AtomicU32::new(0),
            fail_first,
            error,
            value,
        }
    }

    #[test]
    fn validates_original_schema() {
        let value = json!({
            "entities": [
                {"id": "crash", "type": "BUG_REPORT", "value": "Login crash"},
                {"id": "login", "type": "PRODUCT_COMPONENT", "value": "Login"}
            ],
            "relationships": [{"source": "crash", "target": "login", "type": "related_to"}]
        });
        let result = validate("d1", &value).unwrap();
        assert_eq!(result.entities.len(), 2);
        assert_eq!(result.entities[0].entity_type, EntityType::BugReport);
        assert_eq!(result.relations[0].predicate, "related_to");
    }

    #[test]
    fn accepts_aliases_and_defaults() {
        let value = json!({
            "entities": [{"name": "dark mode", "type": "feature request"}],
            "relations": [{"subject": "dark mode", "object": "ui"}]
        });
        let result = validate("d1", &value).unwrap();
        assert_eq!(result.entities[0].local_id, "dark mode");
        assert_eq!(result.relations[0].predicate, "related_to");
    }

    #[test]
    fn wrong_shape_is_schema_violation() {
        let err = validate("d1", &json!(["not", "an", "object"])).unwrap_err();
        assert_eq!(err.reason, ReasonCode::SchemaViolation);

        let err = validate("d1", &json!({"entities": "oops"})).unwrap_err();
        assert_eq!(err.reason, ReasonCode::SchemaViolation);
    }

    #[test]
    fn nothing_valid_is_empty_structure() {
        let err = validate("d1", &json!({"entities": [{"type": "BUG_REPORT"}]})).unwrap_err();
        assert_eq!(err.reason, ReasonCode::EmptyStructure);
        let err = validate("d1", &json!({})).unwrap_err();
        assert_eq!(err.reason, ReasonCode::EmptyStructure);
    }

    #[test]
    fn drops_relations_without_endpoints_and_duplicate_ids() {
        let value = json!({
            "entities": [
                {"id": "a", "type": "BUG_REPORT", "value": "x"},
                {"id": "a", "type": "BUG_REPORT", "value": "y"}
            ],
            "relationships": [{"source": "a", "type": "describes"}]
        });
        let result = validate("d1", &value).unwrap();
        assert_eq!(result.entities.len(), 1);
        assert!(result.relations.is_empty());
    }

    #[tokio::test]
    async fn empty_document_is_skipped_without_calling_oracle() {
        let oracle = scripted(0, OracleError::Rejected("x".into()), json!({}));
        let doc = Document::new("blank", "   \n");
        let out = extract(&doc, &oracle, &RetryPolicy::immediate(3)).await.unwrap();
        assert!(out.is_none());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let oracle = scripted(
            2,
            OracleError::Transient("429".into()),
            json!({"entities": [{"id": "a", "type": "BUG_REPORT", "value": "login crash"}]}),
        );
        let doc = Document::new("d1", "App crashes on login");
        let out = extract(&doc, &oracle, &RetryPolicy::immediate(3)).await.unwrap();
        assert_eq!(out.unwrap().entities[0].name, "login crash");
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_carry_reason_code() {
        let oracle = scripted(10, OracleError::Transient("timeout".into()), json!({}));
        let doc = Document::new("d2", "Would love a dark mode option");
        let err = extract(&doc, &oracle, &RetryPolicy::immediate(2)).await.unwrap_err();
        assert_eq!(err.document_id, "d2");
        assert_eq!(err.reason, ReasonCode::RetriesExhausted);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
    }
}
