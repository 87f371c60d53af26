//! Error taxonomy for the graph core.
//!
//! `Configuration` is reserved for misuse that cannot be retried (undeclared
//! index requested, malformed schema); callers are expected to surface it
//! immediately rather than schedule a retry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown entity type `{0}`")]
    UnknownType(String),

    #[error("node not found: {node_type}/{id}")]
    NodeNotFound { node_type: String, id: String },

    #[error("node already exists: {node_type}/{id}")]
    NodeExists { node_type: String, id: String },

    #[error("unknown field `{field}` on `{node_type}`")]
    UnknownField { node_type: String, field: String },

    #[error("type mismatch for field `{field}`: expected {expected}")]
    TypeMismatch { field: String, expected: String },

    #[error("field resolution cycle at `{0}`")]
    ResolutionCycle(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Serialization(err.to_string())
    }
}

impl GraphError {
    /// True for errors that indicate caller/schema misuse rather than a
    /// runtime condition worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GraphError::Configuration(_)
                | GraphError::UnknownType(_)
                | GraphError::UnknownField { .. }
        )
    }
}
