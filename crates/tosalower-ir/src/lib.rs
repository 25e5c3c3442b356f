//! # tosalower IR
//!
//! Data model shared by the lowering pipeline:
//!
//! - [`TosaSpecification`]: the compilation target (dialect version, profile, extensions)
//! - [`Graph`], [`Node`], [`Value`]: captured operator graphs in topological order
//! - [`QuantArgs`]: per-tensor and per-channel quantization parameters
//! - [`ExportedProgram`]: a graph plus the data of its parameters and constants
//! - [`tosa`]: the emitted TOSA program and its builder
//!
//! ## Building a graph
//!
//! ```rust
//! use tosalower_ir::{ops::aten, Arg, DType, Graph};
//!
//! let mut graph = Graph::new();
//! let x = graph.add_input("x", vec![1, 8], DType::Float32);
//! let relu =
//!     graph.create_node("relu", aten::RELU, vec![Arg::Value(x)], vec![1, 8], DType::Float32);
//! let y = relu.output();
//! graph.push_node(relu);
//! graph.add_output(y);
//!
//! assert!(graph.validate().is_ok());
//! ```

pub mod dtype;
pub mod error;
pub mod graph;
pub mod ops;
pub mod program;
pub mod quant;
pub mod spec;
pub mod tensor;
pub mod tosa;

pub use dtype::DType;
pub use error::IrError;
pub use graph::{validate_graph, Arg, Graph, Node, NodeMeta, Value, ValueId, ValueKind};
pub use program::{ExportedProgram, StateDict};
pub use quant::QuantArgs;
pub use spec::{Extension, NumericProfile, Profile, TosaSpecification, TosaVersion};
pub use tensor::{TensorData, TensorStorage};
pub use tosa::{Attribute, RoundingMode, TosaDType, TosaGraphBuilder, TosaOp, TosaProgram};
