//! Pipeline tables and the ordering contract.
//!
//! The backend pipelines are data: each row names a pass constructor and
//! whether it belongs to the restricted integer pipeline, the full one, or
//! both. Assembly filters the rows for a target and checks the result
//! against [`ORDERING_CONSTRAINTS`].

use std::fmt;

use tosalower_ir::TosaSpecification;

use super::casting::{
    CastBoolToInt8Pass, CastInt64BuffersToInt32Pass, CastToInt32Pass,
    DecorateFp32toInt32CastingPass, MatchArgDtypePass,
};
use super::constants::{
    AddBiasPass, ComputeConstantOpsAOT, FuseBatchnorm2DPass, FuseConstantArgsPass,
    FuseEqualPlaceholdersPass, ReplaceInfValues,
};
use super::convert::{
    ConvertAnyDefaultDimDimsPass, ConvertExpandCopyToRepeatPass, ConvertFullLikeToFullPass,
    ConvertIntPowToMuls, ConvertMinMaxPass, ConvertMmToBmmPass, ConvertSplitToSlicePass,
    ConvertSqueezesToViewPass, ConvertToClampPass, FuseViewCopyTransform, RemoveClonePass,
    RemoveGetItemPass, ReplaceScalarWithTensorArgPass, UnsqueezeBeforeRepeatPass,
};
use super::decompose::{
    Conv1dUnsqueezePass, DecomposeAdaptiveAvgPool2dPass, DecomposeAvgPool2d, DecomposeDivPass,
    DecomposeGeluPass, DecomposeGroupedConv, DecomposeLayerNormPass, DecomposeLeakyReLUPass,
    DecomposeLinearPass, DecomposeLinearVectorNormPass, DecomposeMeanDimPass,
    DecomposeNotEqualPass, DecomposeRoundPass, DecomposeSelectPass, DecomposeSignPass,
    DecomposeSiluPass, DecomposeSinhPass, DecomposeSoftmaxPass, DecomposeSoftmaxUnstablePass,
    DecomposeSqrtPass, DecomposeSumPass, DecomposeVarPass,
};
use super::quantization::{
    FoldAndAnnotateQParamsPass, FuseQuantizedActivationPass, InsertRescalePass,
    InsertTableOpsPass, QuantizeOperatorArguments, RetraceFoldedDtypesPass,
};
use super::shape::{
    AnnotateChannelsLastDimOrder, BroadcastArgsPass, MatchArgRanksPass, SizeAdjustInputPass,
    UnsqueezeScalarPlaceholdersPass,
};
use super::{GraphPass, PassEntry, ProgramPass};
use crate::error::{LoweringError, Result};

/// Which integer pipelines a table row belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inclusion {
    Always,
    /// Only when the target carries the restricted-capability extension.
    RestrictedOnly,
    /// Only when it does not.
    FullOnly,
}

impl Inclusion {
    pub fn includes(self, restricted: bool) -> bool {
        match self {
            Inclusion::Always => true,
            Inclusion::RestrictedOnly => restricted,
            Inclusion::FullOnly => !restricted,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineName {
    TosaInt,
    TosaIntRestricted,
    TosaFp,
    Annotation,
    Custom,
}

impl PipelineName {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineName::TosaInt => "tosa-int",
            PipelineName::TosaIntRestricted => "tosa-int-restricted",
            PipelineName::TosaFp => "tosa-fp",
            PipelineName::Annotation => "annotation",
            PipelineName::Custom => "custom",
        }
    }

    /// Backend pipelines end in a graph every visitor can lower.
    pub fn is_backend(self) -> bool {
        matches!(
            self,
            PipelineName::TosaInt | PipelineName::TosaIntRestricted | PipelineName::TosaFp
        )
    }
}

impl fmt::Display for PipelineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(earlier, later)`: when both passes are in a pipeline, `earlier` must
/// come first.
pub const ORDERING_CONSTRAINTS: &[(&str, &str)] = &[
    (FoldAndAnnotateQParamsPass::NAME, InsertRescalePass::NAME),
    (DecomposeVarPass::NAME, DecomposeMeanDimPass::NAME),
    (DecomposeLayerNormPass::NAME, DecomposeMeanDimPass::NAME),
    (ReplaceScalarWithTensorArgPass::NAME, ComputeConstantOpsAOT::NAME),
    (MatchArgRanksPass::NAME, BroadcastArgsPass::NAME),
    (DecomposeLinearPass::NAME, AddBiasPass::NAME),
];

/// Reported as the `later` side when a required pass is missing.
const END_OF_PIPELINE: &str = "lowering";

type Row = (fn() -> PassEntry, Inclusion);

fn g<P: GraphPass + Default + 'static>() -> PassEntry {
    PassEntry::graph(P::default())
}

fn p<P: ProgramPass + Default + 'static>() -> PassEntry {
    PassEntry::program(P::default())
}

use Inclusion::{Always, RestrictedOnly};

/// Rows shared by both backend pipelines once quantization parameters and
/// constants are settled.
const BACKEND_TAIL: &[Row] = &[
    (g::<DecomposeGroupedConv>, Always),
    (g::<RemoveClonePass>, Always),
    (g::<ConvertExpandCopyToRepeatPass>, Always),
    (g::<UnsqueezeBeforeRepeatPass>, Always),
    (p::<CastInt64BuffersToInt32Pass>, Always),
    (g::<DecomposeSumPass>, Always),
    (g::<Conv1dUnsqueezePass>, Always),
    (g::<SizeAdjustInputPass>, Always),
    (g::<DecomposeSelectPass>, Always),
    (g::<ConvertSqueezesToViewPass>, Always),
    (g::<FuseViewCopyTransform>, Always),
    (p::<FuseConstantArgsPass>, Always),
    (p::<AddBiasPass>, Always),
    (p::<InsertTableOpsPass>, Always),
    (p::<FuseEqualPlaceholdersPass>, Always),
    (g::<AnnotateChannelsLastDimOrder>, Always),
    (g::<InsertRescalePass>, Always),
];

const INT_HEAD: &[Row] = &[
    (g::<FuseQuantizedActivationPass>, Always),
    (g::<RemoveGetItemPass>, Always),
    (g::<ConvertSplitToSlicePass>, Always),
    (g::<ConvertMmToBmmPass>, Always),
    (g::<DecomposeLinearVectorNormPass>, Always),
    (g::<DecomposeMeanDimPass>, Always),
    (g::<ConvertFullLikeToFullPass>, Always),
    (g::<ConvertToClampPass>, Always),
    (g::<ConvertMinMaxPass>, Always),
    (g::<ConvertAnyDefaultDimDimsPass>, Always),
    (g::<MatchArgDtypePass>, Always),
    (g::<CastToInt32Pass>, RestrictedOnly),
    (g::<CastBoolToInt8Pass>, Always),
    (g::<ReplaceScalarWithTensorArgPass>, Always),
    (g::<QuantizeOperatorArguments>, Always),
    (p::<FoldAndAnnotateQParamsPass>, Always),
    (g::<RetraceFoldedDtypesPass>, Always),
    (p::<UnsqueezeScalarPlaceholdersPass>, Always),
    (p::<MatchArgRanksPass>, Always),
    (g::<BroadcastArgsPass>, RestrictedOnly),
    (g::<DecomposeLinearPass>, Always),
    (g::<DecomposeAdaptiveAvgPool2dPass>, Always),
    (g::<DecomposeAvgPool2d>, Always),
    (p::<ComputeConstantOpsAOT>, Always),
];

const FP_HEAD: &[Row] = &[
    (g::<DecomposeRoundPass>, Always),
    (g::<DecomposeSqrtPass>, Always),
    (g::<ConvertIntPowToMuls>, Always),
    (g::<CastBoolToInt8Pass>, Always),
    (g::<DecomposeSinhPass>, Always),
    (g::<DecomposeSignPass>, Always),
    (g::<ReplaceScalarWithTensorArgPass>, Always),
    (g::<FuseQuantizedActivationPass>, Always),
    (g::<RemoveGetItemPass>, Always),
    (g::<ConvertSplitToSlicePass>, Always),
    (p::<FuseBatchnorm2DPass>, Always),
    (g::<ConvertMmToBmmPass>, Always),
    (g::<DecomposeLinearPass>, Always),
    (g::<DecomposeLeakyReLUPass>, Always),
    (g::<DecomposeLayerNormPass>, Always),
    (g::<DecomposeVarPass>, Always),
    (g::<DecomposeMeanDimPass>, Always),
    (g::<DecomposeNotEqualPass>, Always),
    (g::<DecomposeDivPass>, Always),
    (g::<DecomposeSoftmaxPass>, Always),
    (g::<DecomposeGeluPass>, Always),
    (g::<ConvertFullLikeToFullPass>, Always),
    (g::<ConvertToClampPass>, Always),
    (g::<ConvertMinMaxPass>, Always),
    (g::<ConvertAnyDefaultDimDimsPass>, Always),
    (g::<MatchArgDtypePass>, Always),
    (g::<QuantizeOperatorArguments>, Always),
    (p::<FoldAndAnnotateQParamsPass>, Always),
    (g::<RetraceFoldedDtypesPass>, Always),
    (p::<UnsqueezeScalarPlaceholdersPass>, Always),
    (p::<MatchArgRanksPass>, Always),
    (g::<DecomposeAdaptiveAvgPool2dPass>, Always),
    (g::<DecomposeAvgPool2d>, Always),
    (g::<DecorateFp32toInt32CastingPass>, Always),
    (p::<ComputeConstantOpsAOT>, Always),
];

const ANNOTATION_HEAD: &[Row] = &[
    (g::<DecomposeRoundPass>, Always),
    (g::<CastBoolToInt8Pass>, Always),
    (g::<DecomposeSignPass>, Always),
    (g::<ReplaceScalarWithTensorArgPass>, Always),
    (g::<DecomposeLayerNormPass>, Always),
    (g::<DecomposeVarPass>, Always),
    (g::<DecomposeMeanDimPass>, Always),
    (g::<DecomposeNotEqualPass>, Always),
    (g::<DecomposeDivPass>, Always),
    (g::<DecomposeLeakyReLUPass>, Always),
    (g::<DecomposeLinearVectorNormPass>, Always),
    (g::<DecomposeSqrtPass>, Always),
    (g::<DecomposeSiluPass>, Always),
    (g::<DecomposeAvgPool2d>, Always),
    (g::<DecomposeSoftmaxUnstablePass>, RestrictedOnly),
    (g::<DecomposeSoftmaxPass>, Inclusion::FullOnly),
    (g::<ConvertMinMaxPass>, Always),
    (g::<ReplaceInfValues>, Always),
    (g::<DecomposeSumPass>, Always),
];

fn build(rows: &[&[Row]], restricted: bool) -> Vec<PassEntry> {
    rows.iter()
        .flat_map(|table| table.iter())
        .filter(|(_, inclusion)| inclusion.includes(restricted))
        .map(|(make, _)| make())
        .collect()
}

/// An ordered list of passes for one target.
#[derive(Debug)]
pub struct Pipeline {
    name: PipelineName,
    spec: TosaSpecification,
    passes: Vec<PassEntry>,
}

impl Pipeline {
    /// The integer pipeline; `spec.is_restricted()` picks the variant.
    pub fn tosa_int(spec: TosaSpecification) -> Result<Self> {
        let restricted = spec.is_restricted();
        let name = if restricted {
            PipelineName::TosaIntRestricted
        } else {
            PipelineName::TosaInt
        };
        let passes = build(&[INT_HEAD, BACKEND_TAIL], restricted);
        Self::assemble(name, spec, passes)
    }

    pub fn tosa_fp(spec: TosaSpecification) -> Result<Self> {
        let passes = build(&[FP_HEAD, BACKEND_TAIL], false);
        Self::assemble(PipelineName::TosaFp, spec, passes)
    }

    /// Decompositions that run on the float graph before quantization.
    pub fn annotation(spec: TosaSpecification) -> Self {
        let passes = build(&[ANNOTATION_HEAD], spec.is_restricted());
        Self::from_entries(PipelineName::Annotation, spec, passes)
    }

    /// Build a pipeline and check it against the ordering contract.
    pub fn assemble(
        name: PipelineName,
        spec: TosaSpecification,
        passes: Vec<PassEntry>,
    ) -> Result<Self> {
        let pipeline = Self::from_entries(name, spec, passes);
        pipeline.check_ordering()?;
        Ok(pipeline)
    }

    /// Build a pipeline without checking it.
    pub fn from_entries(
        name: PipelineName,
        spec: TosaSpecification,
        passes: Vec<PassEntry>,
    ) -> Self {
        Pipeline { name, spec, passes }
    }

    pub fn check_ordering(&self) -> Result<()> {
        let violation = |earlier: &'static str, later: &'static str| {
            LoweringError::PipelineOrdering {
                pipeline: self.name.to_string(),
                earlier,
                later,
            }
        };

        for &(earlier, later) in ORDERING_CONSTRAINTS {
            if let (Some(e), Some(l)) = (self.position(earlier), self.position(later)) {
                if e > l {
                    return Err(violation(earlier, later));
                }
            }
        }

        if self.name.is_backend() && !self.contains(SizeAdjustInputPass::NAME) {
            return Err(violation(SizeAdjustInputPass::NAME, END_OF_PIPELINE));
        }

        if let Some(decorate) = self.position(DecorateFp32toInt32CastingPass::NAME) {
            let late_cast = self.passes[decorate..].iter().find(|p| p.inserts_casts());
            if let Some(pass) = late_cast {
                return Err(violation(pass.name(), DecorateFp32toInt32CastingPass::NAME));
            }
        }
        Ok(())
    }

    /// Index of the pass called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.passes.iter().position(|p| p.name() == name)
    }

    pub fn name(&self) -> PipelineName {
        self.name
    }

    pub fn spec(&self) -> &TosaSpecification {
        &self.spec
    }

    pub fn passes(&self) -> &[PassEntry] {
        &self.passes
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(PassEntry::name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::PassKind;

    fn spec(s: &str) -> TosaSpecification {
        s.parse().unwrap()
    }

    #[test]
    fn test_int_pipeline_order() {
        let pipeline = Pipeline::tosa_int(spec("TOSA-1.0+INT")).unwrap();
        let names = pipeline.pass_names();
        assert_eq!(names.first(), Some(&FuseQuantizedActivationPass::NAME));
        assert_eq!(names.last(), Some(&InsertRescalePass::NAME));
        assert_eq!(pipeline.name(), PipelineName::TosaInt);
        assert!(!pipeline.contains(CastToInt32Pass::NAME));
        assert!(!pipeline.contains(BroadcastArgsPass::NAME));
        assert!(!pipeline.contains(DecorateFp32toInt32CastingPass::NAME));
    }

    #[test]
    fn test_restricted_adds_two_passes_in_place() {
        let pipeline = Pipeline::tosa_int(spec("TOSA-0.80+BI+u55")).unwrap();
        let names = pipeline.pass_names();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert_eq!(pos(CastToInt32Pass::NAME), pos(MatchArgDtypePass::NAME) + 1);
        assert_eq!(pos(BroadcastArgsPass::NAME), pos(MatchArgRanksPass::NAME) + 1);
        assert_eq!(pipeline.name(), PipelineName::TosaIntRestricted);
    }

    #[test]
    fn test_fp_pipeline_decorates_after_casts() {
        let pipeline = Pipeline::tosa_fp(spec("TOSA-1.0+FP")).unwrap();
        let decorate = pipeline.position(DecorateFp32toInt32CastingPass::NAME).unwrap();
        for (i, pass) in pipeline.passes().iter().enumerate() {
            if pass.inserts_casts() {
                assert!(i < decorate, "{} runs after the cast decoration", pass.name());
            }
        }
        assert!(pipeline.contains(FuseBatchnorm2DPass::NAME));
    }

    #[test]
    fn test_annotation_softmax_variant() {
        let full = Pipeline::annotation(spec("TOSA-1.0+INT"));
        let restricted = Pipeline::annotation(spec("TOSA-1.0+INT+u55"));
        assert!(full.contains(DecomposeSoftmaxPass::NAME));
        assert!(!full.contains(DecomposeSoftmaxUnstablePass::NAME));
        assert!(restricted.contains(DecomposeSoftmaxUnstablePass::NAME));
        assert!(!restricted.contains(DecomposeSoftmaxPass::NAME));
        assert!(full.check_ordering().is_ok());
    }

    #[test]
    fn test_ordering_violation_detected() {
        let passes = vec![p::<AddBiasPass>(), g::<DecomposeLinearPass>()];
        let err =
            Pipeline::assemble(PipelineName::Custom, spec("TOSA-1.0+FP"), passes).unwrap_err();
        assert!(matches!(
            err,
            LoweringError::PipelineOrdering {
                earlier: "DecomposeLinearPass",
                later: "AddBiasPass",
                ..
            }
        ));
    }

    #[test]
    fn test_backend_requires_size_adjustment() {
        let passes = vec![g::<RemoveClonePass>()];
        let err =
            Pipeline::assemble(PipelineName::TosaInt, spec("TOSA-1.0+INT"), passes).unwrap_err();
        assert!(err.to_string().contains("SizeAdjustInputPass"));
        let custom = vec![g::<RemoveClonePass>()];
        assert!(Pipeline::assemble(PipelineName::Custom, spec("TOSA-1.0+INT"), custom).is_ok());
    }

    #[test]
    fn test_cast_after_decoration_rejected() {
        let passes = vec![g::<DecorateFp32toInt32CastingPass>(), g::<MatchArgDtypePass>()];
        let pipeline = Pipeline::from_entries(PipelineName::Custom, spec("TOSA-1.0+FP"), passes);
        assert!(pipeline.check_ordering().is_err());
    }

    #[test]
    fn test_program_passes_are_program_aware() {
        let pipeline = Pipeline::tosa_int(spec("TOSA-1.0+INT")).unwrap();
        let kind = |name: &str| {
            pipeline.passes().iter().find(|p| p.name() == name).map(PassEntry::kind)
        };
        assert_eq!(kind(FoldAndAnnotateQParamsPass::NAME), Some(PassKind::ProgramAware));
        assert_eq!(kind(RemoveClonePass::NAME), Some(PassKind::Structural));
    }
}
