//! Elementwise operators, casts and batched matrix multiplication.
//!
//! Most operators map one-to-one onto a TOSA operator and are described by
//! a row in [`ELEMENTWISE`]. Quantized operands of additive and comparison
//! operators are first rescaled into int32 at a common scale; the result of
//! an arithmetic operator is rescaled back into its output parameters.

use std::sync::Arc;

use tosalower_ir::ops::aten;
use tosalower_ir::{Attribute, DType, Node, QuantArgs, TosaGraphBuilder, TosaOp, TosaSpecification};

use super::quant::{rescale_from_int32, rescale_to_int32, unary_qparams};
use super::{
    emit_mul, intermediate_like, scalar_const, specs, zero_point_const, NodeVisitor, Operands,
    TensorArg, TosaArg, VisitorRegistry,
};
use crate::error::{LoweringError, Result};

/// How a row of [`ELEMENTWISE`] is emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lowering {
    /// A single operator over the tensor operands in argument order.
    Direct(TosaOp),
    /// `ADD`, `SUB`, `MAXIMUM` or `MINIMUM`: quantized operands meet at a
    /// common int32 scale and the result is rescaled.
    Additive(TosaOp),
    Mul,
    /// A comparison, optionally with swapped operands or a negated result.
    Compare { op: TosaOp, swap: bool, negate: bool },
    /// `ABS` or `NEGATE`; quantized inputs are centered in int32 first.
    Unary(TosaOp),
    RightShift,
}

struct Elementwise {
    target: &'static str,
    lowering: Lowering,
    specs: fn() -> Vec<TosaSpecification>,
}

const fn row(
    target: &'static str,
    lowering: Lowering,
    specs: fn() -> Vec<TosaSpecification>,
) -> Elementwise {
    Elementwise {
        target,
        lowering,
        specs,
    }
}

const fn compare(op: TosaOp, swap: bool, negate: bool) -> Lowering {
    Lowering::Compare { op, swap, negate }
}

use Lowering::{Additive, Direct, Mul, RightShift, Unary};

const ELEMENTWISE: &[Elementwise] = &[
    row(aten::ADD, Additive(TosaOp::Add), specs::all),
    row(aten::SUB, Additive(TosaOp::Sub), specs::all),
    row(aten::MAXIMUM, Additive(TosaOp::Maximum), specs::all),
    row(aten::MINIMUM, Additive(TosaOp::Minimum), specs::all),
    row(aten::MUL, Mul, specs::all),
    row(aten::DIV, Direct(TosaOp::Intdiv), specs::all),
    row(aten::EQ, compare(TosaOp::Equal, false, false), specs::all),
    row(aten::NE, compare(TosaOp::Equal, false, true), specs::all),
    row(aten::GT, compare(TosaOp::Greater, false, false), specs::all),
    row(aten::GE, compare(TosaOp::GreaterEqual, false, false), specs::all),
    row(aten::LT, compare(TosaOp::Greater, true, false), specs::all),
    row(aten::LE, compare(TosaOp::GreaterEqual, true, false), specs::all),
    row(aten::LOGICAL_AND, Direct(TosaOp::LogicalAnd), specs::all),
    row(aten::LOGICAL_OR, Direct(TosaOp::LogicalOr), specs::all),
    row(aten::LOGICAL_XOR, Direct(TosaOp::LogicalXor), specs::all),
    row(aten::LOGICAL_NOT, Direct(TosaOp::LogicalNot), specs::all),
    row(aten::BITWISE_AND, Direct(TosaOp::BitwiseAnd), specs::all),
    row(aten::BITWISE_OR, Direct(TosaOp::BitwiseOr), specs::all),
    row(aten::BITWISE_XOR, Direct(TosaOp::BitwiseXor), specs::all),
    row(aten::BITWISE_NOT, Direct(TosaOp::BitwiseNot), specs::all),
    row(aten::LSHIFT, Direct(TosaOp::LogicalLeftShift), specs::all),
    row(aten::RSHIFT, RightShift, specs::all),
    row(aten::WHERE, Direct(TosaOp::Select), specs::all),
    row(aten::ABS, Unary(TosaOp::Abs), specs::all),
    row(aten::NEG, Unary(TosaOp::Negate), specs::all),
    row(aten::EXP, Direct(TosaOp::Exp), specs::floating_point),
    row(aten::LOG, Direct(TosaOp::Log), specs::floating_point),
    row(aten::RECIPROCAL, Direct(TosaOp::Reciprocal), specs::floating_point),
    row(aten::RSQRT, Direct(TosaOp::Rsqrt), specs::floating_point),
    row(aten::SIGMOID, Direct(TosaOp::Sigmoid), specs::floating_point),
    row(aten::TANH, Direct(TosaOp::Tanh), specs::floating_point),
    row(aten::ERF, Direct(TosaOp::Erf), specs::floating_point),
    row(aten::FLOOR, Direct(TosaOp::Floor), specs::floating_point),
    row(aten::CEIL, Direct(TosaOp::Ceil), specs::floating_point),
];

fn tensor_names(inputs: &[TosaArg]) -> Vec<String> {
    inputs
        .iter()
        .filter_map(|arg| match arg {
            TosaArg::Tensor(t) => Some(t.name.clone()),
            _ => None,
        })
        .collect()
}

/// Both input parameters of a quantized binary node.
fn binary_qparams(node: &Node) -> Option<(&QuantArgs, &QuantArgs)> {
    Some((node.input_qparams(0)?, node.input_qparams(1)?))
}

fn output_qparams(node: &Node) -> Result<&QuantArgs> {
    node.output_qparams(0).ok_or_else(|| {
        LoweringError::invalid_argument(&node.name, "quantized result has no output parameters")
    })
}

/// Rescale two quantized operands into int32 at the smaller of their scales.
fn to_common_scale(
    builder: &mut TosaGraphBuilder,
    a: &TensorArg,
    b: &TensorArg,
    qa: &QuantArgs,
    qb: &QuantArgs,
) -> Result<(TensorArg, TensorArg, f64)> {
    let (sa, sb) = (qa.scale_per_tensor()?, qb.scale_per_tensor()?);
    let common = sa.min(sb);
    let a = rescale_to_int32(builder, a, qa.zp_per_tensor()?, sa / common)?;
    let b = rescale_to_int32(builder, b, qb.zp_per_tensor()?, sb / common)?;
    Ok((a, b, common))
}

/// `NEGATE` takes zero-point operands on 1.0.
fn emit_unary(
    builder: &mut TosaGraphBuilder,
    op: TosaOp,
    input: &TensorArg,
    output: &str,
) -> Result<()> {
    let mut operands = vec![input.name.clone()];
    if op == TosaOp::Negate && !builder.spec().is_legacy() {
        let izp = zero_point_const(builder, &format!("{output}_input_zp"), input.dtype, 0)?;
        let ozp = zero_point_const(builder, &format!("{output}_output_zp"), input.dtype, 0)?;
        operands.extend([izp, ozp]);
    }
    builder.add_operator(op, operands, vec![output.to_string()], Attribute::None)?;
    Ok(())
}

impl Elementwise {
    fn additive(
        &self,
        op: TosaOp,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        ops: &Operands<'_>,
        output: &TensorArg,
    ) -> Result<()> {
        let (a, b) = (ops.tensor(0)?, ops.tensor(1)?);
        let Some((qa, qb)) = binary_qparams(node) else {
            builder.add_operator(
                op,
                vec![a.name.clone(), b.name.clone()],
                vec![output.name.clone()],
                Attribute::None,
            )?;
            return Ok(());
        };
        let out_q = output_qparams(node)?;
        let (a, b, common) = to_common_scale(builder, a, b, qa, qb)?;
        let hint = format!("{}_int32", output.name);
        let wide = intermediate_like(builder, &hint, output, DType::Int32)?;
        builder.add_operator(op, vec![a.name, b.name], vec![wide.name.clone()], Attribute::None)?;
        let scale = common / out_q.scale_per_tensor()?;
        rescale_from_int32(builder, &wide, output, &[scale], out_q.zp_per_tensor()?)
    }

    fn mul(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        ops: &Operands<'_>,
        output: &TensorArg,
    ) -> Result<()> {
        let (a, b) = (ops.tensor(0)?, ops.tensor(1)?);
        let Some((qa, qb)) = binary_qparams(node) else {
            return emit_mul(builder, &a.name, &b.name, &output.name);
        };
        let out_q = output_qparams(node)?;
        let a = rescale_to_int32(builder, a, qa.zp_per_tensor()?, 1.0)?;
        let b = rescale_to_int32(builder, b, qb.zp_per_tensor()?, 1.0)?;
        let hint = format!("{}_int32", output.name);
        let wide = intermediate_like(builder, &hint, output, DType::Int32)?;
        emit_mul(builder, &a.name, &b.name, &wide.name)?;
        let scale = qa.scale_per_tensor()? * qb.scale_per_tensor()? / out_q.scale_per_tensor()?;
        rescale_from_int32(builder, &wide, output, &[scale], out_q.zp_per_tensor()?)
    }

    fn compare(
        &self,
        (op, swap, negate): (TosaOp, bool, bool),
        node: &Node,
        builder: &mut TosaGraphBuilder,
        ops: &Operands<'_>,
        output: &TensorArg,
    ) -> Result<()> {
        let (mut a, mut b) = (ops.tensor(0)?.clone(), ops.tensor(1)?.clone());
        if let Some((qa, qb)) = binary_qparams(node) {
            (a, b, _) = to_common_scale(builder, &a, &b, qa, qb)?;
        }
        if swap {
            std::mem::swap(&mut a, &mut b);
        }
        let result = if negate {
            let hint = format!("{}_equal", output.name);
            intermediate_like(builder, &hint, output, DType::Bool)?.name
        } else {
            output.name.clone()
        };
        builder.add_operator(op, vec![a.name, b.name], vec![result.clone()], Attribute::None)?;
        if negate {
            builder.add_operator(
                TosaOp::LogicalNot,
                vec![result],
                vec![output.name.clone()],
                Attribute::None,
            )?;
        }
        Ok(())
    }

    fn unary(
        &self,
        op: TosaOp,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        ops: &Operands<'_>,
        output: &TensorArg,
    ) -> Result<()> {
        let input = ops.tensor(0)?;
        let Some((in_q, out_q)) = unary_qparams(node) else {
            return emit_unary(builder, op, input, &output.name);
        };
        let centered = rescale_to_int32(builder, input, in_q.zp_per_tensor()?, 1.0)?;
        let hint = format!("{}_int32", output.name);
        let wide = intermediate_like(builder, &hint, output, DType::Int32)?;
        emit_unary(builder, op, &centered, &wide.name)?;
        let scale = in_q.scale_per_tensor()? / out_q.scale_per_tensor()?;
        rescale_from_int32(builder, &wide, output, &[scale], out_q.zp_per_tensor()?)
    }
}

impl NodeVisitor for Elementwise {
    fn target(&self) -> &'static str {
        self.target
    }

    fn tosa_specs(&self) -> Vec<TosaSpecification> {
        (self.specs)()
    }

    fn define_node(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        inputs: &[TosaArg],
        output: &TensorArg,
    ) -> Result<()> {
        let ops = Operands::new(node, inputs);
        match self.lowering {
            Lowering::Direct(op) => {
                builder.add_operator(
                    op,
                    tensor_names(inputs),
                    vec![output.name.clone()],
                    Attribute::None,
                )?;
                Ok(())
            }
            Lowering::Additive(op) => self.additive(op, node, builder, &ops, output),
            Lowering::Mul => self.mul(node, builder, &ops, output),
            Lowering::Compare { op, swap, negate } => {
                self.compare((op, swap, negate), node, builder, &ops, output)
            }
            Lowering::Unary(op) => self.unary(op, node, builder, &ops, output),
            Lowering::RightShift => {
                builder.add_operator(
                    TosaOp::ArithmeticRightShift,
                    tensor_names(inputs),
                    vec![output.name.clone()],
                    Attribute::ArithmeticRightShift { round: false },
                )?;
                Ok(())
            }
        }
    }
}

/// `clamp(input, min|None, max|None)`.
struct ClampVisitor;

impl NodeVisitor for ClampVisitor {
    fn target(&self) -> &'static str {
        aten::CLAMP
    }

    fn tosa_specs(&self) -> Vec<TosaSpecification> {
        specs::all()
    }

    fn define_node(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        inputs: &[TosaArg],
        output: &TensorArg,
    ) -> Result<()> {
        let ops = Operands::new(node, inputs);
        let input = ops.tensor(0)?;
        let bound = |index: usize, default: f64| -> Result<f64> {
            if ops.is_none(index) {
                Ok(default)
            } else {
                ops.float(index)
            }
        };
        let attribute = if input.dtype.is_float() {
            let min_fp = bound(1, -f64::from(f32::MAX))?;
            let max_fp = bound(2, f64::from(f32::MAX))?;
            Attribute::Clamp {
                min_int: 0,
                max_int: 0,
                min_fp,
                max_fp,
            }
        } else {
            let lo = input.dtype.int_min().unwrap_or(i64::MIN);
            let hi = input.dtype.int_max().unwrap_or(i64::MAX);
            let min_int = bound(1, lo as f64)?.round() as i64;
            let max_int = bound(2, hi as f64)?.round() as i64;
            Attribute::Clamp {
                min_int: min_int.max(lo),
                max_int: max_int.min(hi),
                min_fp: 0.0,
                max_fp: 0.0,
            }
        };
        builder.add_operator(
            TosaOp::Clamp,
            vec![input.name.clone()],
            vec![output.name.clone()],
            attribute,
        )?;
        Ok(())
    }
}

/// `pow(input, exponent)` with a constant exponent.
struct PowVisitor;

impl NodeVisitor for PowVisitor {
    fn target(&self) -> &'static str {
        aten::POW_SCALAR
    }

    fn tosa_specs(&self) -> Vec<TosaSpecification> {
        specs::floating_point()
    }

    fn define_node(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        inputs: &[TosaArg],
        output: &TensorArg,
    ) -> Result<()> {
        let ops = Operands::new(node, inputs);
        let input = ops.tensor(0)?;
        let exponent = match ops.get(1) {
            Some(TosaArg::Tensor(t)) => t.name.clone(),
            _ => {
                let hint = format!("{}_exponent", output.name);
                scalar_const(builder, &hint, input.dtype, input.rank(), ops.float(1)?)?
            }
        };
        builder.add_operator(
            TosaOp::Pow,
            vec![input.name.clone(), exponent],
            vec![output.name.clone()],
            Attribute::None,
        )?;
        Ok(())
    }
}

/// `_to_copy(input, dtype)` as `CAST`. Casts marked truncating round toward
/// zero first: `select(x >= 0, floor(x), ceil(x))`.
struct ToCopyVisitor;

impl ToCopyVisitor {
    fn truncate(builder: &mut TosaGraphBuilder, input: &TensorArg, hint: &str) -> Result<String> {
        let zero = scalar_const(builder, &format!("{hint}_zero"), input.dtype, input.rank(), 0.0)?;
        let positive = intermediate_like(builder, &format!("{hint}_positive"), input, DType::Bool)?;
        builder.add_operator(
            TosaOp::GreaterEqual,
            vec![input.name.clone(), zero],
            vec![positive.name.clone()],
            Attribute::None,
        )?;
        let floor = intermediate_like(builder, &format!("{hint}_floor"), input, input.dtype)?;
        builder.add_operator(
            TosaOp::Floor,
            vec![input.name.clone()],
            vec![floor.name.clone()],
            Attribute::None,
        )?;
        let ceil = intermediate_like(builder, &format!("{hint}_ceil"), input, input.dtype)?;
        builder.add_operator(
            TosaOp::Ceil,
            vec![input.name.clone()],
            vec![ceil.name.clone()],
            Attribute::None,
        )?;
        let truncated = intermediate_like(builder, &format!("{hint}_trunc"), input, input.dtype)?;
        builder.add_operator(
            TosaOp::Select,
            vec![positive.name, floor.name, ceil.name],
            vec![truncated.name.clone()],
            Attribute::None,
        )?;
        Ok(truncated.name)
    }
}

impl NodeVisitor for ToCopyVisitor {
    fn target(&self) -> &'static str {
        aten::TO_COPY
    }

    fn tosa_specs(&self) -> Vec<TosaSpecification> {
        specs::all()
    }

    fn define_node(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        inputs: &[TosaArg],
        output: &TensorArg,
    ) -> Result<()> {
        let input = Operands::new(node, inputs).tensor(0)?;
        if input.dtype == output.dtype {
            builder.add_operator(
                TosaOp::Identity,
                vec![input.name.clone()],
                vec![output.name.clone()],
                Attribute::None,
            )?;
            return Ok(());
        }
        let source = if node.meta.truncating_cast && input.dtype.is_float() {
            Self::truncate(builder, input, &output.name)?
        } else {
            input.name.clone()
        };
        builder.add_operator(
            TosaOp::Cast,
            vec![source],
            vec![output.name.clone()],
            Attribute::None,
        )?;
        Ok(())
    }
}

/// `bmm(a, b)` as `MATMUL`; int8 operands accumulate in int32.
struct BmmVisitor;

impl NodeVisitor for BmmVisitor {
    fn target(&self) -> &'static str {
        aten::BMM
    }

    fn tosa_specs(&self) -> Vec<TosaSpecification> {
        specs::all()
    }

    fn define_node(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        inputs: &[TosaArg],
        output: &TensorArg,
    ) -> Result<()> {
        let ops = Operands::new(node, inputs);
        let (a, b) = (ops.tensor(0)?, ops.tensor(1)?);
        if a.rank() != 3 || b.rank() != 3 {
            return Err(LoweringError::invalid_argument(
                &node.name,
                format!("bmm expects rank-3 operands, got {:?} and {:?}", a.shape, b.shape),
            ));
        }
        let qparams = binary_qparams(node);
        let (a_zp, b_zp) = match qparams {
            Some((qa, qb)) => (qa.zp_per_tensor()?, qb.zp_per_tensor()?),
            None => (0, 0),
        };
        let rescale = qparams.is_some() && matches!(output.dtype, DType::Int8 | DType::Int16);
        let result = if rescale {
            intermediate_like(builder, &format!("{}_matmul", output.name), output, DType::Int32)?
        } else {
            output.clone()
        };

        let mut operands = vec![a.name.clone(), b.name.clone()];
        let attribute = if builder.spec().is_legacy() {
            Attribute::MatMul { a_zp, b_zp }
        } else {
            let name = &result.name;
            let azp = zero_point_const(builder, &format!("{name}_a_zp"), a.dtype, a_zp)?;
            let bzp = zero_point_const(builder, &format!("{name}_b_zp"), b.dtype, b_zp)?;
            operands.extend([azp, bzp]);
            Attribute::None
        };
        builder.add_operator(TosaOp::Matmul, operands, vec![result.name.clone()], attribute)?;

        if let (true, Some((qa, qb))) = (rescale, qparams) {
            let out_q = output_qparams(node)?;
            let scale =
                qa.scale_per_tensor()? * qb.scale_per_tensor()? / out_q.scale_per_tensor()?;
            rescale_from_int32(builder, &result, output, &[scale], out_q.zp_per_tensor()?)?;
        }
        Ok(())
    }
}

pub(super) fn register(registry: &mut VisitorRegistry) -> Result<()> {
    for row in ELEMENTWISE {
        registry.register(Arc::new(Elementwise {
            target: row.target,
            lowering: row.lowering,
            specs: row.specs,
        }))?;
    }
    registry.register(Arc::new(ClampVisitor))?;
    registry.register(Arc::new(PowVisitor))?;
    registry.register(Arc::new(ToCopyVisitor))?;
    registry.register(Arc::new(BmmVisitor))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tosalower_ir::{Arg, RoundingMode, TosaDType, ValueId};

    fn declare(builder: &mut TosaGraphBuilder, t: &TensorArg) {
        let dtype = TosaDType::from_dtype(t.dtype).unwrap();
        builder.add_tensor(&t.name, &t.physical_shape(), dtype).unwrap();
    }

    fn node(target: &str, arity: usize) -> Node {
        let args = (0..arity).map(|i| Arg::Value(ValueId(i))).collect();
        Node::new("n", target, args, vec![ValueId(arity)])
    }

    fn lower(
        spec: &str,
        node: &Node,
        operands: &[TensorArg],
        output: &TensorArg,
    ) -> TosaGraphBuilder {
        let mut builder = TosaGraphBuilder::new(spec.parse().unwrap());
        for t in operands.iter().chain([output]) {
            declare(&mut builder, t);
        }
        let registry = VisitorRegistry::with_builtin_visitors().unwrap();
        let visitor = registry.resolve(node, builder.spec()).unwrap();
        let inputs: Vec<TosaArg> = operands.iter().cloned().map(TosaArg::Tensor).collect();
        visitor.define_node(node, &mut builder, &inputs, output).unwrap();
        builder
    }

    fn ops(builder: &TosaGraphBuilder) -> Vec<TosaOp> {
        builder.operators().iter().map(|op| op.op).collect()
    }

    fn int8(name: &str) -> TensorArg {
        TensorArg::new(name, vec![2, 3], DType::Int8)
    }

    #[test]
    fn test_quantized_add_meets_at_common_scale() {
        let mut add = node(aten::ADD, 2);
        add.annotate_input(0, QuantArgs::int8(0.5, 1)).unwrap();
        add.annotate_input(1, QuantArgs::int8(0.25, 0)).unwrap();
        add.annotate_output(0, QuantArgs::int8(0.5, 2)).unwrap();
        let b = lower("TOSA-0.80+BI", &add, &[int8("a"), int8("b")], &int8("y"));

        assert_eq!(
            ops(&b),
            vec![TosaOp::Rescale, TosaOp::Rescale, TosaOp::Add, TosaOp::Rescale]
        );
        let rescales: Vec<_> = b
            .operators()
            .iter()
            .filter(|op| op.op == TosaOp::Rescale)
            .map(|op| match &op.attribute {
                Attribute::Rescale {
                    multiplier,
                    shift,
                    input_zp,
                    output_zp,
                    ..
                } => (multiplier[0], shift[0], input_zp.unwrap(), output_zp.unwrap()),
                other => panic!("unexpected attribute {other:?}"),
            })
            .collect();
        // a: x2 with its zero point removed, b: x1, result: x0.5 into zp 2
        assert_eq!(rescales[0], (1 << 30, 29, 1, 0));
        assert_eq!(rescales[1], (1 << 30, 30, 0, 0));
        assert_eq!(rescales[2], (1 << 30, 31, 0, 2));
        assert_eq!(b.tensor(&b.operators()[2].outputs[0]).unwrap().dtype, TosaDType::Int32);
    }

    #[test]
    fn test_float_add_is_direct() {
        let x = TensorArg::new("x", vec![4], DType::Float32);
        let y = TensorArg::new("y", vec![4], DType::Float32);
        let out = TensorArg::new("out", vec![4], DType::Float32);
        let b = lower("TOSA-1.0+FP", &node(aten::ADD, 2), &[x, y], &out);
        assert_eq!(ops(&b), vec![TosaOp::Add]);
        assert_eq!(b.operators()[0].inputs, vec!["x", "y"]);
    }

    #[test]
    fn test_less_than_swaps_operands() {
        let bool_out = TensorArg::new("y", vec![2, 3], DType::Bool);
        let b = lower("TOSA-1.0+INT", &node(aten::LT, 2), &[int8("a"), int8("b")], &bool_out);
        let op = &b.operators()[0];
        assert_eq!(op.op, TosaOp::Greater);
        assert_eq!(op.inputs, vec!["b", "a"]);
    }

    #[test]
    fn test_not_equal_negates() {
        let bool_out = TensorArg::new("y", vec![2, 3], DType::Bool);
        let b = lower("TOSA-1.0+INT", &node(aten::NE, 2), &[int8("a"), int8("b")], &bool_out);
        assert_eq!(ops(&b), vec![TosaOp::Equal, TosaOp::LogicalNot]);
        assert_eq!(b.operators()[1].outputs, vec!["y"]);
    }

    #[test]
    fn test_v1_mul_has_shift_operand() {
        let x = TensorArg::new("x", vec![4], DType::Int32);
        let y = TensorArg::new("y", vec![4], DType::Int32);
        let out = TensorArg::new("out", vec![4], DType::Int32);
        let b = lower("TOSA-1.0+INT", &node(aten::MUL, 2), &[x, y], &out);
        assert_eq!(b.operators()[0].inputs, vec!["x", "y", "out_shift"]);
        assert_eq!(b.tensor("out_shift").unwrap().dtype, TosaDType::Int8);
    }

    #[test]
    fn test_truncating_cast() {
        let mut cast = node(aten::TO_COPY, 1);
        cast.meta.truncating_cast = true;
        let x = TensorArg::new("x", vec![4], DType::Float32);
        let out = TensorArg::new("out", vec![4], DType::Int32);
        let b = lower("TOSA-1.0+FP", &cast, &[x], &out);
        assert_eq!(
            ops(&b),
            vec![
                TosaOp::GreaterEqual,
                TosaOp::Floor,
                TosaOp::Ceil,
                TosaOp::Select,
                TosaOp::Cast
            ]
        );
    }

    #[test]
    fn test_clamp_bounds() {
        let mut builder = TosaGraphBuilder::new("TOSA-1.0+FP".parse().unwrap());
        let x = TensorArg::new("x", vec![4], DType::Float32);
        let out = TensorArg::new("out", vec![4], DType::Float32);
        declare(&mut builder, &x);
        declare(&mut builder, &out);
        let clamp = node(aten::CLAMP, 1);
        let inputs = vec![TosaArg::Tensor(x), TosaArg::Float(0.0), TosaArg::None];
        ClampVisitor.define_node(&clamp, &mut builder, &inputs, &out).unwrap();
        match builder.operators()[0].attribute {
            Attribute::Clamp { min_fp, max_fp, .. } => {
                assert_eq!(min_fp, 0.0);
                assert_eq!(max_fp, f64::from(f32::MAX));
            }
            ref other => panic!("unexpected attribute {other:?}"),
        }
    }

    #[test]
    fn test_quantized_bmm() {
        let mut bmm = node(aten::BMM, 2);
        bmm.annotate_input(0, QuantArgs::int8(0.5, -3)).unwrap();
        bmm.annotate_input(1, QuantArgs::int8(0.5, 0)).unwrap();
        bmm.annotate_output(0, QuantArgs::int8(0.25, 0)).unwrap();
        let a = TensorArg::new("a", vec![1, 2, 4], DType::Int8);
        let w = TensorArg::new("w", vec![1, 4, 3], DType::Int8);
        let out = TensorArg::new("y", vec![1, 2, 3], DType::Int8);
        let b = lower("TOSA-1.0+INT", &bmm, &[a, w], &out);
        assert_eq!(ops(&b), vec![TosaOp::Matmul, TosaOp::Rescale]);
        let matmul = &b.operators()[0];
        assert_eq!(matmul.inputs.len(), 4);
        let a_zp = b.tensor(&matmul.inputs[2]).unwrap().data.clone().unwrap();
        assert_eq!(a_zp.to_i64_vec(), vec![-3]);
        assert!(matches!(
            b.operators()[1].attribute,
            Attribute::Rescale {
                rounding_mode: RoundingMode::SingleRound,
                ..
            }
        ));
    }

    #[test]
    fn test_table_rows_are_unique() {
        let mut targets: Vec<_> = ELEMENTWISE.iter().map(|r| r.target).collect();
        targets.sort_unstable();
        targets.dedup();
        assert_eq!(targets.len(), ELEMENTWISE.len());
    }
}
