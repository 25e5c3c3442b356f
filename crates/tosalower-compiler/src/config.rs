//! Compilation options.

use serde::{Deserialize, Serialize};
use tosalower_ir::TosaSpecification;

/// Options for one compilation.
///
/// ```
/// use tosalower_compiler::CompilationConfig;
///
/// let config = CompilationConfig::new("TOSA-1.0+INT".parse().unwrap())
///     .with_validate_each_pass(true)
///     .with_dump_graph_after("InsertRescalePass");
/// assert!(config.validate_each_pass);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationConfig {
    /// Target to compile for.
    pub spec: TosaSpecification,
    /// Run graph validation after every pass.
    #[serde(default)]
    pub validate_each_pass: bool,
    /// Check the pass ordering table when a pipeline is assembled.
    #[serde(default = "default_true")]
    pub check_pipeline_ordering: bool,
    /// Log the graph at debug level after these passes.
    #[serde(default)]
    pub dump_graph_after: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl CompilationConfig {
    pub fn new(spec: TosaSpecification) -> Self {
        CompilationConfig {
            spec,
            validate_each_pass: false,
            check_pipeline_ordering: true,
            dump_graph_after: Vec::new(),
        }
    }

    pub fn with_validate_each_pass(mut self, enabled: bool) -> Self {
        self.validate_each_pass = enabled;
        self
    }

    pub fn with_check_pipeline_ordering(mut self, enabled: bool) -> Self {
        self.check_pipeline_ordering = enabled;
        self
    }

    pub fn with_dump_graph_after(mut self, pass: impl Into<String>) -> Self {
        self.dump_graph_after.push(pass.into());
        self
    }

    pub fn dumps_after(&self, pass: &str) -> bool {
        self.dump_graph_after.iter().any(|p| p == pass)
    }
}
