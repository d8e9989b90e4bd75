//! Error taxonomy for the build and query pipelines.
//!
//! Per-unit build failures (one document, one community, one embedded
//! object) are contained and aggregated into a
//! [`BuildReport`](crate::report::BuildReport). Query failures are returned
//! to the caller as [`QueryError`]; no partial answer is ever produced.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{CommunityId, DocumentId, OwnerId};

/// Failure of a single oracle invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    /// Rate limiting, timeouts, 5xx, connection errors. Worth retrying.
    #[error("transient oracle failure: {0}")]
    Transient(String),

    /// The backend refused the request (4xx, missing credentials, ...).
    #[error("oracle rejected request: {0}")]
    Rejected(String),

    /// The backend answered but the payload is unusable.
    #[error("malformed oracle response: {0}")]
    Malformed(String),
}

impl OracleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Transient(_))
    }
}

/// Machine-readable reason attached to every contained failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    RetriesExhausted,
    OracleRejected,
    MalformedResponse,
    EmptyStructure,
    SchemaViolation,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::RetriesExhausted => "retries_exhausted",
            ReasonCode::OracleRejected => "oracle_rejected",
            ReasonCode::MalformedResponse => "malformed_response",
            ReasonCode::EmptyStructure => "empty_structure",
            ReasonCode::SchemaViolation => "schema_violation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retries_exhausted" => Some(ReasonCode::RetriesExhausted),
            "oracle_rejected" => Some(ReasonCode::OracleRejected),
            "malformed_response" => Some(ReasonCode::MalformedResponse),
            "empty_structure" => Some(ReasonCode::EmptyStructure),
            "schema_violation" => Some(ReasonCode::SchemaViolation),
            _ => None,
        }
    }

    /// Reason code for an oracle error that survived the retry loop.
    pub fn for_oracle(err: &OracleError) -> Self {
        match err {
            OracleError::Transient(_) => ReasonCode::RetriesExhausted,
            OracleError::Rejected(_) => ReasonCode::OracleRejected,
            OracleError::Malformed(_) => ReasonCode::MalformedResponse,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structure oracle gave nothing usable for a non-empty document.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("extraction failed for document '{document_id}' ({reason}): {message}")]
pub struct ExtractionError {
    pub document_id: DocumentId,
    pub reason: ReasonCode,
    pub message: String,
}

impl ExtractionError {
    pub fn new(document_id: &str, reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            document_id: document_id.to_string(),
            reason,
            message: message.into(),
        }
    }
}

/// Summary generation failed for one community; a placeholder was used.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("summarization failed for community {community_id} ({reason}): {message}")]
pub struct SummarizationFailure {
    pub community_id: CommunityId,
    pub reason: ReasonCode,
    pub message: String,
}

/// Embedding failed for one object; it is left out of the index.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("embedding failed for {owner_id} ({reason}): {message}")]
pub struct EmbeddingFailure {
    pub owner_id: OwnerId,
    pub reason: ReasonCode,
    pub message: String,
}

/// A relation dropped during assembly because an endpoint did not resolve
/// to an entity of the same extraction.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("dropped relation '{subject}' -[{predicate}]-> '{object}' in document '{document_id}': unknown endpoint '{missing}'")]
pub struct DanglingRelationWarning {
    pub document_id: DocumentId,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub missing: String,
}

/// Fatal error for a single `answer` call.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Query-time embedding does not match what the index was built with.
    #[error("embedding mismatch: index built with {expected}, query produced {actual}")]
    EmbeddingMismatch { expected: String, actual: String },

    #[error("could not embed question: {0}")]
    QueryEmbedding(OracleError),

    #[error("nothing relevant was retrieved for the question")]
    NothingRetrieved,

    #[error("answer synthesis failed: {0}")]
    Synthesis(OracleError),

    #[error("query cancelled")]
    Cancelled,
}
