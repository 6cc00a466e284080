use crate::graph::GraphError;

/// Failure to translate one source operator. Every variant names the operator by its index
/// in the source model; translation stops at the first failing operator.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    #[error("model has no operator {0}")]
    UnknownOperator(usize),
    #[error("operator {operator} ({op}) expects {expected} {direction} tensors, found {actual}")]
    Arity {
        operator: usize,
        op: String,
        direction: &'static str,
        expected: String,
        actual: usize,
    },
    #[error("operator {operator}: tensor {tensor} is invalid: {reason}")]
    InvalidTensor {
        operator: usize,
        tensor: i32,
        reason: String,
    },
    #[error("operator {operator}: {op} is not supported: {reason}")]
    UnsupportedOperator {
        operator: usize,
        op: String,
        reason: String,
    },
    #[error("operator {operator}: tensor {tensor} is dynamically shaped")]
    UnsupportedDynamicShape { operator: usize, tensor: usize },
    #[error("operator {operator}: {source}")]
    Graph {
        operator: usize,
        #[source]
        source: GraphError,
    },
    /// A model input or output tensor which cannot become a boundary layer.
    #[error("model {direction} tensor {tensor} is invalid: {reason}")]
    InvalidBoundary {
        direction: &'static str,
        tensor: i32,
        reason: String,
    },
    #[error("translated graph is incomplete: {0}")]
    Incomplete(#[source] GraphError),
    #[error("cannot read source model: {0}")]
    Json(String),
}

impl From<serde_json::Error> for TranslationError {
    fn from(error: serde_json::Error) -> Self {
        TranslationError::Json(error.to_string())
    }
}
