//! Ahead-of-time lowering of captured operator graphs to TOSA.
//!
//! # Overview
//!
//! Compilation runs in two stages:
//!
//! 1. **Legalization**: a [`PassManager`] applies the pipeline selected for
//!    the target [`TosaSpecification`](tosalower_ir::TosaSpecification).
//!    Integer targets get the `tosa-int` pipeline (with two extra passes on
//!    restricted hardware), floating-point targets get `tosa-fp`. After the
//!    pipeline every node is an operator the backend can express.
//! 2. **Emission**: each node is handed to the [`NodeVisitor`] registered for
//!    its operator and the target, which writes TOSA operators into a
//!    [`TosaGraphBuilder`](tosalower_ir::TosaGraphBuilder).
//!
//! Passes and visitors that depend on the target read it from the
//! [`LoweringContext`], which is bound for the duration of each stage.
//!
//! # Quick Start
//!
//! ```rust
//! use tosalower_compiler::passes::select_pipeline;
//! use tosalower_compiler::passes::PipelineName;
//!
//! let spec = "TOSA-0.80+BI+u55".parse().unwrap();
//! let pipeline = select_pipeline(&spec).unwrap();
//! assert_eq!(pipeline.name(), PipelineName::TosaIntRestricted);
//! assert!(pipeline.contains("CastToInt32Pass"));
//! ```
//!
//! # Modules
//!
//! - [`passes`]: the pass contract, the pass catalog and pipeline assembly
//! - [`visitors`]: the visitor registry and the per-operator visitors
//! - [`config`]: compilation options

pub mod config;
mod context;
pub mod error;
mod lower;
pub mod passes;
pub mod visitors;


pub use config::CompilationConfig;
pub use context::{LoweringContext, LoweringGuard};
pub use error::{LoweringError, Result};
pub use lower::{compile, compile_with_registry, lower_to_tosa};
pub use passes::{select_annotation_pipeline, select_pipeline, PassManager, Pipeline};
pub use visitors::{NodeVisitor, TensorArg, TosaArg, VisitorRegistry};
