//! Decompositions of composite operators into operators with a direct TOSA
//! lowering.
//!
//! Scalars introduced here are always `full` nodes of shape `[1; rank]`, so
//! decompositions may run on either side of
//! [`ReplaceScalarWithTensorArgPass`](super::convert::ReplaceScalarWithTensorArgPass)
//! as long as they precede [`ComputeConstantOpsAOT`](super::constants::ComputeConstantOpsAOT).

mod activation;
mod arithmetic;
mod conv;
mod reduction;

pub use activation::{
    DecomposeGeluPass, DecomposeLeakyReLUPass, DecomposeRoundPass, DecomposeSignPass,
    DecomposeSiluPass, DecomposeSinhPass, DecomposeSoftmaxPass, DecomposeSoftmaxUnstablePass,
    DecomposeSqrtPass,
};
pub use arithmetic::{DecomposeDivPass, DecomposeNotEqualPass, DecomposeSelectPass};
pub use conv::{
    Conv1dUnsqueezePass, DecomposeAdaptiveAvgPool2dPass, DecomposeAvgPool2d, DecomposeGroupedConv,
    DecomposeLinearPass,
};
pub use reduction::{
    DecomposeLayerNormPass, DecomposeLinearVectorNormPass, DecomposeMeanDimPass, DecomposeSumPass,
    DecomposeVarPass,
};
