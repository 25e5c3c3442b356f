//! The emitted TOSA program.
//!
//! A [`TosaProgram`] is a flat list of named tensors and operators over them,
//! built incrementally through [`TosaGraphBuilder`] and serialized as JSON.

mod attribute;
mod builder;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use attribute::{Attribute, RoundingMode};
pub use builder::TosaGraphBuilder;

use crate::dtype::DType;
use crate::error::IrError;
use crate::spec::TosaSpecification;
use crate::tensor::TensorData;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TosaDType {
    Bool,
    Int4,
    Int8,
    Int16,
    Int32,
    Int48,
    Fp16,
    Bf16,
    Fp32,
    Shape,
}

impl TosaDType {
    pub fn from_dtype(dtype: DType) -> Result<Self, IrError> {
        match dtype {
            DType::Bool => Ok(TosaDType::Bool),
            DType::Int8 => Ok(TosaDType::Int8),
            DType::Int16 => Ok(TosaDType::Int16),
            DType::Int32 => Ok(TosaDType::Int32),
            DType::Float16 => Ok(TosaDType::Fp16),
            DType::BFloat16 => Ok(TosaDType::Bf16),
            DType::Float32 => Ok(TosaDType::Fp32),
            DType::Int64 => Err(IrError::UnsupportedDType {
                dtype: dtype.to_string(),
                context: "TOSA tensors".to_string(),
            }),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, TosaDType::Fp16 | TosaDType::Bf16 | TosaDType::Fp32)
    }
}

impl fmt::Display for TosaDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TosaDType::Bool => "BOOL",
            TosaDType::Int4 => "INT4",
            TosaDType::Int8 => "INT8",
            TosaDType::Int16 => "INT16",
            TosaDType::Int32 => "INT32",
            TosaDType::Int48 => "INT48",
            TosaDType::Fp16 => "FP16",
            TosaDType::Bf16 => "BF16",
            TosaDType::Fp32 => "FP32",
            TosaDType::Shape => "SHAPE",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TosaOp {
    Const,
    Identity,
    Conv2d,
    DepthwiseConv2d,
    Matmul,
    AvgPool2d,
    MaxPool2d,
    Rescale,
    Cast,
    Table,
    Clamp,
    Sigmoid,
    Tanh,
    Erf,
    Add,
    Sub,
    Mul,
    Intdiv,
    Maximum,
    Minimum,
    Pow,
    Abs,
    Negate,
    Exp,
    Log,
    Reciprocal,
    Rsqrt,
    Floor,
    Ceil,
    Equal,
    Greater,
    GreaterEqual,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    LogicalNot,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseNot,
    LogicalLeftShift,
    LogicalRightShift,
    ArithmeticRightShift,
    Select,
    ReduceSum,
    ReduceMax,
    ReduceMin,
    ReduceAny,
    Reshape,
    Transpose,
    Slice,
    Concat,
    Tile,
    Pad,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TosaTensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: TosaDType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TensorData>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TosaOperator {
    pub op: TosaOp,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attribute: Attribute,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TosaProgram {
    pub spec: TosaSpecification,
    pub tensors: Vec<TosaTensor>,
    pub operators: Vec<TosaOperator>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl TosaProgram {
    pub fn tensor(&self, name: &str) -> Option<&TosaTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn count(&self, op: TosaOp) -> usize {
        self.operators.iter().filter(|o| o.op == op).count()
    }

    pub fn operators_of(&self, op: TosaOp) -> impl Iterator<Item = &TosaOperator> {
        self.operators.iter().filter(move |o| o.op == op)
    }

    pub fn to_json_pretty(&self) -> Result<String, IrError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, IrError> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn shape_to_i64(shape: &[usize]) -> Vec<i64> {
    shape.iter().map(|&d| d as i64).collect()
}
