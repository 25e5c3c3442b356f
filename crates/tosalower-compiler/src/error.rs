//! Error types for pipeline selection, legalization and visiting.

use thiserror::Error;
use tosalower_ir::{IrError, TosaSpecification};

pub type Result<T, E = LoweringError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum LoweringError {
    #[error("No lowering pipeline for target {spec}")]
    UnsupportedSpecification { spec: TosaSpecification },

    #[error("{pass} cannot legalize node {node}: {message}")]
    Legalization {
        pass: &'static str,
        node: String,
        message: String,
    },

    #[error(
        "Node {node}: padding {pad} cannot be adjusted for input size {input_size}, \
         kernel {kernel}, stride {stride}, dilation {dilation} (remainder {remainder})"
    )]
    InvalidPadding {
        node: String,
        input_size: i64,
        kernel: i64,
        stride: i64,
        pad: i64,
        dilation: i64,
        remainder: i64,
    },

    #[error("No visitor for {target} (node {node}) on target {spec}")]
    NoVisitor {
        node: String,
        target: String,
        spec: TosaSpecification,
    },

    #[error("Visitors for {target} overlap on target {spec}")]
    VisitorConflict {
        target: String,
        spec: TosaSpecification,
    },

    #[error("Pipeline {pipeline}: {earlier} must run before {later}")]
    PipelineOrdering {
        pipeline: String,
        earlier: &'static str,
        later: &'static str,
    },

    #[error("Pass {pass} failed for target {spec}: {source}")]
    PassFailed {
        pass: &'static str,
        spec: TosaSpecification,
        #[source]
        source: Box<LoweringError>,
    },

    #[error("No TOSA specification is active on this thread")]
    NoActiveSpecification,

    #[error("Node {node}: invalid argument: {message}")]
    InvalidArgument { node: String, message: String },

    #[error(transparent)]
    Ir(#[from] IrError),
}

impl LoweringError {
    pub fn legalization(pass: &'static str, node: &str, message: impl Into<String>) -> Self {
        LoweringError::Legalization {
            pass,
            node: node.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_argument(node: &str, message: impl Into<String>) -> Self {
        LoweringError::InvalidArgument {
            node: node.to_string(),
            message: message.into(),
        }
    }

    /// The innermost error, looking through [`LoweringError::PassFailed`].
    pub fn root_cause(&self) -> &LoweringError {
        match self {
            LoweringError::PassFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
