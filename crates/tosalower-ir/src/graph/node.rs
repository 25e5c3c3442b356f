//! Operator nodes and their arguments.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dtype::DType;
use crate::error::IrError;
use crate::quant::QuantArgs;

use super::ValueId;

/// A positional argument of a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arg {
    Value(ValueId),
    Values(Vec<ValueId>),
    Int(i64),
    Ints(Vec<i64>),
    Float(f64),
    Floats(Vec<f64>),
    Bool(bool),
    #[serde(rename = "dtype")]
    DType(DType),
    Str(String),
    None,
}

impl Arg {
    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Arg::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_values(&self) -> Option<&[ValueId]> {
        match self {
            Arg::Values(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(*v),
            Arg::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Arg::Ints(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric scalar; integers widen to `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Arg::Float(v) => Some(*v),
            Arg::Int(v) => Some(*v as f64),
            Arg::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f64]> {
        match self {
            Arg::Floats(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_dtype(&self) -> Option<DType> {
        match self {
            Arg::DType(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Arg::None)
    }

    /// True for numeric scalars (`Int`, `Float`, `Bool`).
    pub fn is_scalar(&self) -> bool {
        matches!(self, Arg::Int(_) | Arg::Float(_) | Arg::Bool(_))
    }

    /// Values referenced by this argument.
    pub fn values(&self) -> &[ValueId] {
        match self {
            Arg::Value(v) => std::slice::from_ref(v),
            Arg::Values(v) => v,
            _ => &[],
        }
    }

    /// Rewrite references to `from` into `to`, returning whether anything changed.
    pub fn replace(&mut self, from: ValueId, to: ValueId) -> bool {
        match self {
            Arg::Value(v) if *v == from => {
                *v = to;
                true
            }
            Arg::Values(vs) => {
                let mut changed = false;
                for v in vs.iter_mut().filter(|v| **v == from) {
                    *v = to;
                    changed = true;
                }
                changed
            }
            _ => false,
        }
    }
}

/// Per-node annotations written by passes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Folded quantization parameters of value arguments, keyed by argument position.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_qparams: BTreeMap<usize, QuantArgs>,
    /// Folded quantization parameters of outputs, keyed by output position.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_qparams: BTreeMap<usize, QuantArgs>,
    /// Set on float-to-int casts that must round toward zero.
    #[serde(default)]
    pub truncating_cast: bool,
}

impl NodeMeta {
    pub fn is_quantized(&self) -> bool {
        !self.input_qparams.is_empty() || !self.output_qparams.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Canonical operator name, see [`crate::ops`].
    pub target: String,
    pub args: Vec<Arg>,
    pub outputs: Vec<ValueId>,
    #[serde(default)]
    pub meta: NodeMeta,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        args: Vec<Arg>,
        outputs: Vec<ValueId>,
    ) -> Self {
        Node {
            name: name.into(),
            target: target.into(),
            args,
            outputs,
            meta: NodeMeta::default(),
        }
    }

    pub fn is(&self, target: &str) -> bool {
        self.target == target
    }

    /// Primary output. Every node in a valid graph has at least one.
    pub fn output(&self) -> ValueId {
        self.outputs[0]
    }

    pub fn arg(&self, index: usize) -> Option<&Arg> {
        self.args.get(index)
    }

    pub fn value_arg(&self, index: usize) -> Option<ValueId> {
        self.arg(index).and_then(Arg::as_value)
    }

    pub fn int_arg(&self, index: usize) -> Option<i64> {
        self.arg(index).and_then(Arg::as_int)
    }

    pub fn ints_arg(&self, index: usize) -> Option<&[i64]> {
        self.arg(index).and_then(Arg::as_ints)
    }

    pub fn float_arg(&self, index: usize) -> Option<f64> {
        self.arg(index).and_then(Arg::as_float)
    }

    pub fn bool_arg(&self, index: usize) -> Option<bool> {
        self.arg(index).and_then(Arg::as_bool)
    }

    pub fn dtype_arg(&self, index: usize) -> Option<DType> {
        self.arg(index).and_then(Arg::as_dtype)
    }

    /// All values consumed by this node, in argument order.
    pub fn inputs(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.args.iter().flat_map(|a| a.values().iter().copied())
    }

    pub fn uses(&self, value: ValueId) -> bool {
        self.inputs().any(|v| v == value)
    }

    pub fn replace_input(&mut self, from: ValueId, to: ValueId) -> bool {
        let mut changed = false;
        for arg in &mut self.args {
            changed |= arg.replace(from, to);
        }
        changed
    }

    pub fn input_qparams(&self, slot: usize) -> Option<&QuantArgs> {
        self.meta.input_qparams.get(&slot)
    }

    pub fn output_qparams(&self, slot: usize) -> Option<&QuantArgs> {
        self.meta.output_qparams.get(&slot)
    }

    /// Record folded input parameters for argument `slot`. Folded parameters
    /// are write-once.
    pub fn annotate_input(&mut self, slot: usize, qparams: QuantArgs) -> Result<(), IrError> {
        if self.meta.input_qparams.contains_key(&slot) {
            return Err(IrError::QParamsAlreadyFolded {
                node: self.name.clone(),
                slot,
                direction: "input",
            });
        }
        self.meta.input_qparams.insert(slot, qparams);
        Ok(())
    }

    pub fn annotate_output(&mut self, slot: usize, qparams: QuantArgs) -> Result<(), IrError> {
        if self.meta.output_qparams.contains_key(&slot) {
            return Err(IrError::QParamsAlreadyFolded {
                node: self.name.clone(),
                slot,
                direction: "output",
            });
        }
        self.meta.output_qparams.insert(slot, qparams);
        Ok(())
    }
}
