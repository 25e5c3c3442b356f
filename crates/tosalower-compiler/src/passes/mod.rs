//! Graph rewrites and the pipelines that sequence them.
//!
//! Every rewrite implements one of two contracts:
//!
//! - [`GraphPass`]: a structural rewrite that only sees the graph.
//! - [`ProgramPass`]: a rewrite that also reads or writes the state dict
//!   (parameters, buffers and lifted constants).
//!
//! Both return whether the graph changed. A pass that finds a node it cannot
//! rewrite fails with [`LoweringError::Legalization`]; it never leaves the
//! graph half rewritten on purpose, and the [`PassManager`] discards the
//! program on failure anyway.
//!
//! Passes hold no state beyond their constructor parameters. The ones that
//! depend on the target read it from the [`LoweringContext`](crate::LoweringContext).

/// Declares a unit-struct pass with its reported name. Defined ahead of the
/// child modules so they see it in textual scope.
macro_rules! unit_pass {
    ($(#[$meta:meta])* $ty:ident) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $ty;

        impl $ty {
            pub const NAME: &'static str = stringify!($ty);
        }
    };
}

pub mod casting;
pub mod constants;
pub mod convert;
pub mod decompose;
pub mod manager;
pub mod pipeline;
pub mod quantization;
pub mod shape;
pub(crate) mod util;

use tosalower_ir::{ExportedProgram, Graph, StateDict};

use crate::error::Result;
#[cfg(doc)]
use crate::error::LoweringError;

pub use manager::{select_annotation_pipeline, select_pipeline, PassManager};
pub use pipeline::{Inclusion, Pipeline, PipelineName, ORDERING_CONSTRAINTS};

/// A rewrite over the graph alone.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrite `graph` in place, returning whether anything changed.
    fn call(&self, graph: &mut Graph) -> Result<bool>;

    /// Whether this pass may insert float-to-integer casts.
    fn inserts_casts(&self) -> bool {
        false
    }
}

/// A rewrite that also reads or updates the data of static values.
pub trait ProgramPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    /// Sees only the graph.
    Structural,
    /// Sees the graph and the state dict.
    ProgramAware,
}

/// One step of a pipeline.
pub enum PassEntry {
    Graph(Box<dyn GraphPass>),
    Program(Box<dyn ProgramPass>),
}

impl PassEntry {
    pub fn graph<P: GraphPass + 'static>(pass: P) -> Self {
        PassEntry::Graph(Box::new(pass))
    }

    pub fn program<P: ProgramPass + 'static>(pass: P) -> Self {
        PassEntry::Program(Box::new(pass))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PassEntry::Graph(p) => p.name(),
            PassEntry::Program(p) => p.name(),
        }
    }

    pub fn kind(&self) -> PassKind {
        match self {
            PassEntry::Graph(_) => PassKind::Structural,
            PassEntry::Program(_) => PassKind::ProgramAware,
        }
    }

    pub fn inserts_casts(&self) -> bool {
        match self {
            PassEntry::Graph(p) => p.inserts_casts(),
            PassEntry::Program(_) => false,
        }
    }

    /// Apply the pass to `program`.
    pub fn apply(&self, program: &mut ExportedProgram) -> Result<bool> {
        match self {
            PassEntry::Graph(p) => p.call(&mut program.graph),
            PassEntry::Program(p) => p.call(&mut program.graph, &mut program.state),
        }
    }
}

impl std::fmt::Debug for PassEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind() {
            PassKind::Structural => "graph",
            PassKind::ProgramAware => "program",
        };
        write!(f, "{}({})", kind, self.name())
    }
}
