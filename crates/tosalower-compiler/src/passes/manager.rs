//! Pipeline selection and execution.

use tosalower_ir::{ExportedProgram, NumericProfile, TosaSpecification};
use tracing::{debug, debug_span, info, info_span};

use super::pipeline::Pipeline;
use crate::config::CompilationConfig;
use crate::context::LoweringContext;
use crate::error::{LoweringError, Result};

/// The backend pipeline for `spec`.
///
/// Integer targets get `tosa-int`, or `tosa-int-restricted` when the target
/// carries `u55`; floating-point targets get `tosa-fp`. Only TOSA 0.80 and
/// 1.0 are supported, and floating point is never restricted.
///
/// ```
/// use tosalower_compiler::passes::{select_pipeline, PipelineName};
///
/// let pipeline = select_pipeline(&"TOSA-0.80+BI+u55".parse().unwrap()).unwrap();
/// assert_eq!(pipeline.name(), PipelineName::TosaIntRestricted);
/// assert!(select_pipeline(&"TOSA-1.0+FP+u55".parse().unwrap()).is_err());
/// ```
pub fn select_pipeline(spec: &TosaSpecification) -> Result<Pipeline> {
    let version = spec.version();
    let supported_version = matches!((version.major, version.minor), (0, 80) | (1, 0));
    if !supported_version {
        return Err(LoweringError::UnsupportedSpecification { spec: spec.clone() });
    }
    match spec.numeric_profile() {
        NumericProfile::IntegerQuantized => Pipeline::tosa_int(spec.clone()),
        NumericProfile::FloatingPoint if !spec.is_restricted() => Pipeline::tosa_fp(spec.clone()),
        NumericProfile::FloatingPoint => {
            Err(LoweringError::UnsupportedSpecification { spec: spec.clone() })
        }
    }
}

/// Decompositions to run on the float graph before it is quantized.
pub fn select_annotation_pipeline(spec: &TosaSpecification) -> Pipeline {
    Pipeline::annotation(spec.clone())
}

/// Runs pipelines over exported programs for one target.
#[derive(Debug, Clone)]
pub struct PassManager {
    config: CompilationConfig,
}

impl PassManager {
    pub fn new(spec: TosaSpecification) -> Self {
        Self::with_config(CompilationConfig::new(spec))
    }

    pub fn with_config(config: CompilationConfig) -> Self {
        PassManager { config }
    }

    pub fn config(&self) -> &CompilationConfig {
        &self.config
    }

    pub fn spec(&self) -> &TosaSpecification {
        &self.config.spec
    }

    /// Apply `pipeline` to `program` in order.
    ///
    /// The first failing pass aborts the run with
    /// [`LoweringError::PassFailed`]; the program is consumed either way, so a
    /// partially rewritten graph never escapes.
    pub fn run(
        &self,
        pipeline: &Pipeline,
        mut program: ExportedProgram,
    ) -> Result<ExportedProgram> {
        let spec = pipeline.spec().clone();
        let _context = LoweringContext::enter(spec.clone());
        let _span = info_span!("pipeline", name = %pipeline.name(), %spec).entered();

        if self.config.check_pipeline_ordering {
            pipeline.check_ordering()?;
        }

        let mut changed_by = 0usize;
        for pass in pipeline.passes() {
            let name = pass.name();
            let _pass_span = debug_span!("pass", name).entered();
            let fail = |source: LoweringError| LoweringError::PassFailed {
                pass: name,
                spec: spec.clone(),
                source: Box::new(source),
            };

            let changed = pass.apply(&mut program).map_err(fail)?;
            if changed {
                program.graph.eliminate_dead_code();
                changed_by += 1;
            }
            debug!(changed, nodes = program.graph.nodes.len(), "pass finished");

            if self.config.validate_each_pass {
                program
                    .validate()
                    .map_err(|e| fail(LoweringError::Ir(e)))?;
            }
            if self.config.dumps_after(name) {
                let graph = &program.graph;
                debug!(target: "tosalower::dump", pass = name, "graph after pass:\n{graph}");
            }
        }

        info!(
            passes = pipeline.len(),
            changed_by,
            nodes = program.graph.nodes.len(),
            "pipeline finished"
        );
        Ok(program)
    }

    /// Run the backend pipeline selected for this manager's target.
    pub fn transform_to_backend_pipeline(
        &self,
        program: ExportedProgram,
    ) -> Result<ExportedProgram> {
        let pipeline = select_pipeline(self.spec())?;
        self.run(&pipeline, program)
    }

    /// Run the pre-quantization decompositions for this manager's target.
    pub fn transform_for_annotation_pipeline(
        &self,
        program: ExportedProgram,
    ) -> Result<ExportedProgram> {
        let pipeline = select_annotation_pipeline(self.spec());
        self.run(&pipeline, program)
    }
}
