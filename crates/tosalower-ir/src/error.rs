//! Error types for the IR.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrError {
    #[error("Invalid TOSA specification '{spec}': {reason}")]
    InvalidSpecification { spec: String, reason: String },
    #[error("Value id {index} out of bounds (graph has {count} values)")]
    ValueOutOfBounds { index: usize, count: usize },
    #[error("Node {node} uses value {value} before it is defined")]
    UseBeforeDefinition { node: String, value: String },
    #[error("Value {value} is produced by more than one node")]
    DuplicateProducer { value: String },
    #[error("Graph output {value} has no producer")]
    OutputWithoutProducer { value: String },
    #[error("Quantization parameters for {direction} {slot} of node {node} are already folded")]
    QParamsAlreadyFolded {
        node: String,
        slot: usize,
        direction: &'static str,
    },
    #[error("Expected per-tensor quantization for {what}, found per-channel parameters")]
    PerChannelQuantization { what: String },
    #[error("Invalid quantization parameters: {reason}")]
    InvalidQuantization { reason: String },
    #[error("Tensor data for {what} has {actual} elements, shape requires {expected}")]
    ElementCountMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid permutation {perm:?} for rank {rank}")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },
    #[error("Data type {dtype} is not supported for {context}")]
    UnsupportedDType { dtype: String, context: String },
    #[error("TOSA tensor {name} referenced before it was declared")]
    UnknownTosaTensor { name: String },
    #[error("TOSA tensor {name} declared twice")]
    DuplicateTosaTensor { name: String },
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for IrError {
    fn from(err: serde_json::Error) -> Self {
        IrError::Serialization(err.to_string())
    }
}
