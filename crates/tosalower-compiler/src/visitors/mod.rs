//! Node visitors: per-operator lowering into TOSA.
//!
//! After the backend pipeline, every node's target is expected to have a
//! visitor for the active specification. The [`VisitorRegistry`] resolves a
//! node to its visitor by `(target, spec)`; an operator can have several
//! visitors as long as their specification sets are disjoint.
//!
//! Visitors work on *physical* shapes: a value with a `dim_order` is laid out
//! as `shape.permute(dim_order)` in the emitted program. [`TensorArg`]
//! carries both views so visitors can map logical axes.

mod conv2d;
mod elementwise;
mod layout;
mod quant;
mod reduction;

use std::collections::BTreeMap;
use std::sync::Arc;

use tosalower_ir::tosa::shape_to_i64;
use tosalower_ir::{
    Arg, Attribute, DType, Extension, Node, Profile, TensorData, TosaDType, TosaGraphBuilder,
    TosaOp, TosaSpecification, TosaVersion, Value,
};

use crate::error::{LoweringError, Result};

pub use conv2d::{adjust_pad_if_needed, conv_rescale_scales, Conv2dVisitor, Conv2dVisitor080};
pub use quant::{compute_multiplier_and_shift, emit_rescale};

/// A tensor operand as seen by a visitor.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorArg {
    /// Name of the tensor in the emitted program.
    pub name: String,
    /// Logical shape.
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Physical order of the logical dimensions, if not the identity.
    pub dim_order: Option<Vec<usize>>,
}

impl TensorArg {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> Self {
        TensorArg {
            name: name.into(),
            shape,
            dtype,
            dim_order: None,
        }
    }

    /// Describe `value` under the emitted name `name`.
    pub fn from_value(name: impl Into<String>, value: &Value) -> Self {
        let identity = value
            .dim_order
            .as_ref()
            .is_some_and(|order| order.iter().enumerate().all(|(i, &d)| i == d));
        TensorArg {
            name: name.into(),
            shape: value.shape.clone(),
            dtype: value.dtype,
            dim_order: if identity { None } else { value.dim_order.clone() },
        }
    }

    pub fn with_dim_order(mut self, order: Vec<usize>) -> Self {
        self.dim_order = Some(order);
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn physical_shape(&self) -> Vec<usize> {
        match &self.dim_order {
            Some(order) => order.iter().map(|&d| self.shape[d]).collect(),
            None => self.shape.clone(),
        }
    }

    /// Physical position of logical axis `axis`.
    pub fn physical_axis(&self, axis: usize) -> usize {
        self.dim_order
            .as_ref()
            .and_then(|order| order.iter().position(|&d| d == axis))
            .unwrap_or(axis)
    }

    /// Permutation from physical to logical layout.
    pub fn inverse_order(&self) -> Option<Vec<usize>> {
        self.dim_order.as_ref().map(|order| invert(order))
    }

    pub fn tosa_dtype(&self) -> Result<TosaDType> {
        Ok(TosaDType::from_dtype(self.dtype)?)
    }
}

pub(crate) fn invert(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

/// A node argument with values resolved to emitted tensors.
#[derive(Clone, Debug, PartialEq)]
pub enum TosaArg {
    Tensor(TensorArg),
    Tensors(Vec<TensorArg>),
    Int(i64),
    Ints(Vec<i64>),
    Float(f64),
    Floats(Vec<f64>),
    Bool(bool),
    DType(DType),
    Str(String),
    None,
}

impl TosaArg {
    /// Convert a non-value argument. Values are resolved by the caller.
    pub fn scalar(arg: &Arg) -> Option<Self> {
        Some(match arg {
            Arg::Int(v) => TosaArg::Int(*v),
            Arg::Ints(v) => TosaArg::Ints(v.clone()),
            Arg::Float(v) => TosaArg::Float(*v),
            Arg::Floats(v) => TosaArg::Floats(v.clone()),
            Arg::Bool(v) => TosaArg::Bool(*v),
            Arg::DType(v) => TosaArg::DType(*v),
            Arg::Str(v) => TosaArg::Str(v.clone()),
            Arg::None => TosaArg::None,
            Arg::Value(_) | Arg::Values(_) => return None,
        })
    }
}

/// Typed access to the resolved arguments of one node.
pub struct Operands<'a> {
    node: &'a Node,
    args: &'a [TosaArg],
}

impl<'a> Operands<'a> {
    pub fn new(node: &'a Node, args: &'a [TosaArg]) -> Self {
        Operands { node, args }
    }

    fn missing(&self, index: usize, what: &str) -> LoweringError {
        LoweringError::invalid_argument(
            &self.node.name,
            format!("argument {index} of {} must be {what}", self.node.target),
        )
    }

    pub fn get(&self, index: usize) -> Option<&'a TosaArg> {
        self.args.get(index)
    }

    pub fn tensor(&self, index: usize) -> Result<&'a TensorArg> {
        match self.args.get(index) {
            Some(TosaArg::Tensor(t)) => Ok(t),
            _ => Err(self.missing(index, "a tensor")),
        }
    }

    pub fn optional_tensor(&self, index: usize) -> Option<&'a TensorArg> {
        match self.args.get(index) {
            Some(TosaArg::Tensor(t)) => Some(t),
            _ => None,
        }
    }

    pub fn tensors(&self, index: usize) -> Result<&'a [TensorArg]> {
        match self.args.get(index) {
            Some(TosaArg::Tensors(t)) => Ok(t),
            _ => Err(self.missing(index, "a tensor list")),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64> {
        match self.args.get(index) {
            Some(TosaArg::Int(v)) => Ok(*v),
            Some(TosaArg::Bool(v)) => Ok(i64::from(*v)),
            _ => Err(self.missing(index, "an integer")),
        }
    }

    pub fn int_or(&self, index: usize, default: i64) -> Result<i64> {
        match self.args.get(index) {
            None | Some(TosaArg::None) => Ok(default),
            _ => self.int(index),
        }
    }

    pub fn ints(&self, index: usize) -> Result<&'a [i64]> {
        match self.args.get(index) {
            Some(TosaArg::Ints(v)) => Ok(v),
            _ => Err(self.missing(index, "an integer list")),
        }
    }

    pub fn float(&self, index: usize) -> Result<f64> {
        match self.args.get(index) {
            Some(TosaArg::Float(v)) => Ok(*v),
            Some(TosaArg::Int(v)) => Ok(*v as f64),
            _ => Err(self.missing(index, "a number")),
        }
    }

    pub fn floats(&self, index: usize) -> Result<&'a [f64]> {
        match self.args.get(index) {
            Some(TosaArg::Floats(v)) => Ok(v),
            _ => Err(self.missing(index, "a float list")),
        }
    }

    pub fn bool_or(&self, index: usize, default: bool) -> Result<bool> {
        match self.args.get(index) {
            None | Some(TosaArg::None) => Ok(default),
            Some(TosaArg::Bool(v)) => Ok(*v),
            _ => Err(self.missing(index, "a boolean")),
        }
    }

    pub fn dtype(&self, index: usize) -> Result<DType> {
        match self.args.get(index) {
            Some(TosaArg::DType(v)) => Ok(*v),
            _ => Err(self.missing(index, "a dtype")),
        }
    }

    pub fn is_none(&self, index: usize) -> bool {
        matches!(self.args.get(index), None | Some(TosaArg::None))
    }
}

/// Lowers one operator for a set of target specifications.
pub trait NodeVisitor: Send + Sync {
    /// Canonical operator name handled by this visitor.
    fn target(&self) -> &'static str;

    /// Further operator names lowered the same way.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Specifications this visitor supports.
    fn tosa_specs(&self) -> Vec<TosaSpecification>;

    /// Emit the operators computing `output` from `inputs`. The output
    /// tensor has already been declared.
    fn define_node(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        inputs: &[TosaArg],
        output: &TensorArg,
    ) -> Result<()>;
}

/// Specifications that lower identically: same dialect version, profile and
/// capability restriction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SpecKey {
    major: u32,
    minor: u32,
    profile: Profile,
    restricted: bool,
}

impl SpecKey {
    fn of(spec: &TosaSpecification) -> Self {
        let version = spec.version();
        SpecKey {
            major: version.major,
            minor: version.minor,
            profile: spec.profile(),
            restricted: spec.is_restricted(),
        }
    }
}

struct Registration {
    keys: Vec<SpecKey>,
    visitor: Arc<dyn NodeVisitor>,
}

/// Two-level lookup from operator name to the visitors registered for it.
#[derive(Default)]
pub struct VisitorRegistry {
    entries: BTreeMap<&'static str, Vec<Registration>>,
}

impl VisitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in visitor.
    ///
    /// ```
    /// use tosalower_compiler::visitors::VisitorRegistry;
    ///
    /// let registry = VisitorRegistry::with_builtin_visitors().unwrap();
    /// let spec = "TOSA-1.0+INT".parse().unwrap();
    /// assert!(registry.supports("aten.convolution.default", &spec));
    /// ```
    pub fn with_builtin_visitors() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(Conv2dVisitor080))?;
        registry.register(Arc::new(Conv2dVisitor))?;
        elementwise::register(&mut registry)?;
        layout::register(&mut registry)?;
        reduction::register(&mut registry)?;
        quant::register(&mut registry)?;
        Ok(registry)
    }

    /// Add `visitor` under its target and aliases. Fails when a visitor with
    /// an overlapping specification set is already registered for one of
    /// those names.
    pub fn register(&mut self, visitor: Arc<dyn NodeVisitor>) -> Result<()> {
        let specs = visitor.tosa_specs();
        let keys: Vec<SpecKey> = specs.iter().map(SpecKey::of).collect();
        let names: Vec<&'static str> = std::iter::once(visitor.target())
            .chain(visitor.aliases().iter().copied())
            .collect();

        for name in &names {
            let registered = self.entries.get(name).map(Vec::as_slice).unwrap_or_default();
            for (spec, key) in specs.iter().zip(&keys) {
                if registered.iter().any(|r| r.keys.contains(key)) {
                    return Err(LoweringError::VisitorConflict {
                        target: name.to_string(),
                        spec: spec.clone(),
                    });
                }
            }
        }
        for name in names {
            self.entries.entry(name).or_default().push(Registration {
                keys: keys.clone(),
                visitor: Arc::clone(&visitor),
            });
        }
        Ok(())
    }

    pub fn resolve_target(
        &self,
        target: &str,
        spec: &TosaSpecification,
    ) -> Option<Arc<dyn NodeVisitor>> {
        let key = SpecKey::of(spec);
        self.entries
            .get(target)?
            .iter()
            .find(|r| r.keys.contains(&key))
            .map(|r| Arc::clone(&r.visitor))
    }

    pub fn resolve(&self, node: &Node, spec: &TosaSpecification) -> Result<Arc<dyn NodeVisitor>> {
        self.resolve_target(&node.target, spec)
            .ok_or_else(|| LoweringError::NoVisitor {
                node: node.name.clone(),
                target: node.target.clone(),
                spec: spec.clone(),
            })
    }

    pub fn supports(&self, target: &str, spec: &TosaSpecification) -> bool {
        self.resolve_target(target, spec).is_some()
    }

    /// Every operator name resolvable for `spec`, sorted.
    pub fn supported_targets(&self, spec: &TosaSpecification) -> Vec<&'static str> {
        let key = SpecKey::of(spec);
        self.entries
            .iter()
            .filter(|(_, regs)| regs.iter().any(|r| r.keys.contains(&key)))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Number of registered operator names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for VisitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorRegistry")
            .field("targets", &self.entries.len())
            .finish()
    }
}

/// Specification sets visitors register for.
pub mod specs {
    use super::*;

    fn spec(version: TosaVersion, profile: Profile) -> TosaSpecification {
        TosaSpecification::new(version, profile)
    }

    fn restricted(version: TosaVersion, profile: Profile) -> TosaSpecification {
        spec(version, profile).with_extension(Extension::U55)
    }

    /// The 0.80 dialect.
    pub fn legacy() -> Vec<TosaSpecification> {
        vec![
            spec(TosaVersion::V0_80, Profile::BaseInference),
            restricted(TosaVersion::V0_80, Profile::BaseInference),
            spec(TosaVersion::V0_80, Profile::MainInference),
        ]
    }

    /// The 1.0 dialect.
    pub fn v1() -> Vec<TosaSpecification> {
        vec![
            spec(TosaVersion::V1_0, Profile::Integer),
            restricted(TosaVersion::V1_0, Profile::Integer),
            spec(TosaVersion::V1_0, Profile::FloatingPoint),
        ]
    }

    pub fn all() -> Vec<TosaSpecification> {
        let mut all = legacy();
        all.extend(v1());
        all
    }

    /// Targets with floating-point operators.
    pub fn floating_point() -> Vec<TosaSpecification> {
        vec![
            spec(TosaVersion::V0_80, Profile::MainInference),
            spec(TosaVersion::V1_0, Profile::FloatingPoint),
        ]
    }

    /// Unrestricted targets of either dialect.
    pub fn full() -> Vec<TosaSpecification> {
        all().into_iter().filter(|s| !s.is_restricted()).collect()
    }
}

// Emission helpers shared by the visitors.

/// `[1, 1, ..]` of the given rank, at least rank one.
pub(crate) fn unit_shape(rank: usize) -> Vec<usize> {
    vec![1; rank.max(1)]
}

/// A broadcastable constant filled with `value`.
pub(crate) fn scalar_const(
    builder: &mut TosaGraphBuilder,
    hint: &str,
    dtype: DType,
    rank: usize,
    value: f64,
) -> Result<String> {
    let tosa_dtype = TosaDType::from_dtype(dtype)?;
    let data = TensorData::full(dtype, unit_shape(rank), value);
    Ok(builder.add_const(hint, tosa_dtype, data))
}

/// One-element zero-point operand of the 1.0 dialect.
pub(crate) fn zero_point_const(
    builder: &mut TosaGraphBuilder,
    hint: &str,
    dtype: DType,
    value: i64,
) -> Result<String> {
    scalar_const(builder, hint, dtype, 1, value as f64)
}

/// A `SHAPE` operand of the 1.0 dialect.
pub(crate) fn shape_const(
    builder: &mut TosaGraphBuilder,
    hint: &str,
    values: &[i64],
) -> Result<String> {
    let data = TensorData::from_i64(DType::Int64, vec![values.len()], values.to_vec())?;
    Ok(builder.add_const(hint, TosaDType::Shape, data))
}

/// `RESHAPE` of `input` into `output` with the physical `new_shape`.
pub(crate) fn emit_reshape(
    builder: &mut TosaGraphBuilder,
    input: &str,
    output: &str,
    new_shape: &[usize],
) -> Result<()> {
    let new_shape = shape_to_i64(new_shape);
    if builder.spec().is_legacy() {
        builder.add_operator(
            TosaOp::Reshape,
            vec![input.to_string()],
            vec![output.to_string()],
            Attribute::Reshape { new_shape },
        )?;
    } else {
        let shape = shape_const(builder, &format!("{output}_shape"), &new_shape)?;
        builder.add_operator(
            TosaOp::Reshape,
            vec![input.to_string(), shape],
            vec![output.to_string()],
            Attribute::None,
        )?;
    }
    Ok(())
}

pub(crate) fn emit_transpose(
    builder: &mut TosaGraphBuilder,
    input: &str,
    output: &str,
    perms: &[usize],
) -> Result<()> {
    builder.add_operator(
        TosaOp::Transpose,
        vec![input.to_string()],
        vec![output.to_string()],
        Attribute::Transpose {
            perms: shape_to_i64(perms),
        },
    )?;
    Ok(())
}

/// `MUL` with a zero result shift, in the operand form of the active dialect.
pub(crate) fn emit_mul(
    builder: &mut TosaGraphBuilder,
    a: &str,
    b: &str,
    output: &str,
) -> Result<()> {
    if builder.spec().is_legacy() {
        builder.add_operator(
            TosaOp::Mul,
            vec![a.to_string(), b.to_string()],
            vec![output.to_string()],
            Attribute::Mul { shift: 0 },
        )?;
    } else {
        let shift = zero_point_const(builder, &format!("{output}_shift"), DType::Int8, 0)?;
        builder.add_operator(
            TosaOp::Mul,
            vec![a.to_string(), b.to_string(), shift],
            vec![output.to_string()],
            Attribute::None,
        )?;
    }
    Ok(())
}

/// Declare an intermediate with the physical layout of `like` and `dtype`.
pub(crate) fn intermediate_like(
    builder: &mut TosaGraphBuilder,
    hint: &str,
    like: &TensorArg,
    dtype: DType,
) -> Result<TensorArg> {
    let tosa_dtype = TosaDType::from_dtype(dtype)?;
    let name = builder.add_intermediate(hint, &like.physical_shape(), tosa_dtype);
    Ok(TensorArg {
        name,
        shape: like.shape.clone(),
        dtype,
        dim_order: like.dim_order.clone(),
    })
}

/// Copy `input` into `output` through the logical layout: transpose out of
/// the input order, reshape, and transpose into the output order.
pub(crate) fn emit_view(
    builder: &mut TosaGraphBuilder,
    input: &TensorArg,
    output: &TensorArg,
) -> Result<()> {
    let dtype = input.tosa_dtype()?;
    let mut source = input.name.clone();
    if let Some(inverse) = input.inverse_order() {
        let hint = format!("{}_logical", output.name);
        let logical = builder.add_intermediate(&hint, &input.shape, dtype);
        emit_transpose(builder, &source, &logical, &inverse)?;
        source = logical;
    }
    match &output.dim_order {
        Some(order) => {
            let hint = format!("{}_reshaped", output.name);
            let reshaped = builder.add_intermediate(&hint, &output.shape, dtype);
            emit_reshape(builder, &source, &reshaped, &output.shape)?;
            emit_transpose(builder, &reshaped, &output.name, order)
        }
        None => emit_reshape(builder, &source, &output.name, &output.shape),
    }
}
