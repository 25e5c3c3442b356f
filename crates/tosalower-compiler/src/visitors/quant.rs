//! Fixed-point rescaling and the quantization boundary operators.

use std::sync::Arc;

use tosalower_ir::ops::{quantized, tosa};
use tosalower_ir::quant::round_half_even;
use tosalower_ir::{
    Attribute, DType, Node, QuantArgs, RoundingMode, TensorData, TosaDType, TosaGraphBuilder,
    TosaOp, TosaSpecification,
};

use super::{
    emit_mul, intermediate_like, specs, zero_point_const, NodeVisitor, Operands, TensorArg, TosaArg,
    VisitorRegistry,
};
use crate::error::{LoweringError, Result};

/// Largest right shift TOSA accepts for a 32-bit multiplier.
const MAX_SHIFT: i32 = 62;
/// Smallest right shift TOSA accepts.
const MIN_SHIFT: i32 = 2;

/// Multiplier and right shift approximating `scale` as
/// `multiplier * 2^-shift` with a 32-bit multiplier.
///
/// ```
/// use tosalower_compiler::visitors::compute_multiplier_and_shift;
///
/// assert_eq!(compute_multiplier_and_shift(1.25).unwrap(), (1342177280, 30));
/// assert_eq!(compute_multiplier_and_shift(2.5).unwrap(), (1342177280, 29));
/// ```
pub fn compute_multiplier_and_shift(scale: f64) -> Result<(i32, i32)> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(LoweringError::invalid_argument(
            "rescale",
            format!("scale {scale} is not a finite non-negative number"),
        ));
    }
    if scale == 0.0 {
        return Ok((0, MIN_SHIFT));
    }
    let (mantissa, mut exponent) = libm::frexp(scale);
    let mut multiplier = round_half_even(mantissa * (1u64 << 31) as f64) as i64;
    if multiplier == 1 << 31 {
        multiplier /= 2;
        exponent += 1;
    }
    let mut shift = 31 - exponent;
    if shift > MAX_SHIFT {
        multiplier >>= (shift - MAX_SHIFT).min(31);
        shift = MAX_SHIFT;
    }
    if shift < MIN_SHIFT {
        return Err(LoweringError::invalid_argument(
            "rescale",
            format!("scale {scale} is too large for a 32-bit rescale"),
        ));
    }
    Ok((multiplier as i32, shift))
}

/// Emit `RESCALE` of `input` into `output`.
///
/// The 0.80 dialect carries multipliers, shifts and zero points as
/// attributes and rounds twice; 1.0 takes them as constant operands and
/// rounds once.
pub fn emit_rescale(
    builder: &mut TosaGraphBuilder,
    input: &TensorArg,
    output: &TensorArg,
    scales: &[f64],
    input_zp: i64,
    output_zp: i64,
) -> Result<()> {
    let (multiplier, shift): (Vec<i32>, Vec<i32>) = scales
        .iter()
        .map(|&s| compute_multiplier_and_shift(s))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();
    let per_channel = scales.len() > 1;

    if builder.spec().is_legacy() {
        builder.add_operator(
            TosaOp::Rescale,
            vec![input.name.clone()],
            vec![output.name.clone()],
            Attribute::Rescale {
                input_zp: Some(input_zp),
                output_zp: Some(output_zp),
                multiplier,
                shift,
                scale32: true,
                rounding_mode: RoundingMode::DoubleRound,
                per_channel,
                input_unsigned: false,
                output_unsigned: false,
            },
        )?;
        return Ok(());
    }

    let count = multiplier.len();
    let name = &output.name;
    let multipliers = TensorData::from_i64(
        DType::Int32,
        vec![count],
        multiplier.into_iter().map(i64::from).collect(),
    )?;
    let shifts =
        TensorData::from_i64(DType::Int8, vec![count], shift.into_iter().map(i64::from).collect())?;
    let multiplier =
        builder.add_const(&format!("{name}_multiplier"), TosaDType::Int32, multipliers);
    let shift = builder.add_const(&format!("{name}_shift"), TosaDType::Int8, shifts);
    let input_zp = zero_point_const(builder, &format!("{name}_input_zp"), input.dtype, input_zp)?;
    let output_zp =
        zero_point_const(builder, &format!("{name}_output_zp"), output.dtype, output_zp)?;
    builder.add_operator(
        TosaOp::Rescale,
        vec![input.name.clone(), multiplier, shift, input_zp, output_zp],
        vec![output.name.clone()],
        Attribute::Rescale {
            input_zp: None,
            output_zp: None,
            multiplier: Vec::new(),
            shift: Vec::new(),
            scale32: true,
            rounding_mode: RoundingMode::SingleRound,
            per_channel,
            input_unsigned: false,
            output_unsigned: false,
        },
    )?;
    Ok(())
}

/// Rescale a quantized operand into int32 at `scale`, removing its zero
/// point.
pub(crate) fn rescale_to_int32(
    builder: &mut TosaGraphBuilder,
    input: &TensorArg,
    input_zp: i64,
    scale: f64,
) -> Result<TensorArg> {
    let hint = format!("{}_int32", input.name);
    let wide = intermediate_like(builder, &hint, input, DType::Int32)?;
    emit_rescale(builder, input, &wide, &[scale], input_zp, 0)?;
    Ok(wide)
}

/// Rescale an int32 accumulator into the quantized `output`.
pub(crate) fn rescale_from_int32(
    builder: &mut TosaGraphBuilder,
    wide: &TensorArg,
    output: &TensorArg,
    scales: &[f64],
    output_zp: i64,
) -> Result<()> {
    emit_rescale(builder, wide, output, scales, 0, output_zp)
}

/// Input and output parameters of a quantized node, when it has both.
pub(crate) fn unary_qparams(node: &Node) -> Option<(&QuantArgs, &QuantArgs)> {
    Some((node.input_qparams(0)?, node.output_qparams(0)?))
}

/// `tosa._rescale(input, dtype, scales, input_zp, output_zp)`.
struct RescaleVisitor;

impl NodeVisitor for RescaleVisitor {
    fn target(&self) -> &'static str {
        tosa::RESCALE
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
        let scales = ops.floats(2)?;
        let input_zp = ops.int(3)?;
        let output_zp = ops.int(4)?;
        emit_rescale(builder, input, output, scales, input_zp, output_zp)
    }
}

/// `tosa._table(input, table)`.
struct TableVisitor;

impl NodeVisitor for TableVisitor {
    fn target(&self) -> &'static str {
        tosa::TABLE
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
        let table = ops.tensor(1)?;
        builder.add_operator(
            TosaOp::Table,
            vec![input.name.clone(), table.name.clone()],
            vec![output.name.clone()],
            Attribute::None,
        )?;
        Ok(())
    }
}

/// Parameters of a boundary node, broadcast along the physical axis of
/// per-channel parameters.
struct BoundaryParams {
    scales: Vec<f64>,
    zero_points: Vec<f64>,
    shape: Vec<usize>,
    qmin: i64,
    qmax: i64,
}

impl BoundaryParams {
    fn parse(node: &Node, ops: &Operands<'_>, input: &TensorArg) -> Result<Self> {
        let rank = input.rank().max(1);
        if node.is(quantized::QUANTIZE_PER_TENSOR) || node.is(quantized::DEQUANTIZE_PER_TENSOR) {
            return Ok(BoundaryParams {
                scales: vec![ops.float(1)?],
                zero_points: vec![ops.int(2)? as f64],
                shape: vec![1; rank],
                qmin: ops.int(3)?,
                qmax: ops.int(4)?,
            });
        }
        let scales = ops.floats(1)?.to_vec();
        let zero_points: Vec<f64> = ops.ints(2)?.iter().map(|&z| z as f64).collect();
        let axis = ops.int(3)?.rem_euclid(rank as i64) as usize;
        let mut shape = vec![1; rank];
        shape[input.physical_axis(axis)] = scales.len();
        Ok(BoundaryParams {
            scales,
            zero_points,
            shape,
            qmin: ops.int(4)?,
            qmax: ops.int(5)?,
        })
    }

    fn constant(
        &self,
        builder: &mut TosaGraphBuilder,
        hint: &str,
        values: Vec<f64>,
    ) -> Result<String> {
        let data = TensorData::from_f64(DType::Float32, self.shape.clone(), values)?;
        Ok(builder.add_const(hint, TosaDType::Fp32, data))
    }
}

/// Quantize on floating-point targets:
/// `cast(clamp(x * (1 / scale) + zp, qmin, qmax))`.
struct QuantizeVisitor;

impl NodeVisitor for QuantizeVisitor {
    fn target(&self) -> &'static str {
        quantized::QUANTIZE_PER_TENSOR
    }

    fn aliases(&self) -> &'static [&'static str] {
        &[quantized::QUANTIZE_PER_CHANNEL]
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
        let params = BoundaryParams::parse(node, &ops, input)?;
        let name = &output.name;

        let inverse = params.scales.iter().map(|s| s.recip()).collect();
        let inverse = params.constant(builder, &format!("{name}_inv_scale"), inverse)?;
        let zero_points = params.zero_points.clone();
        let zp = params.constant(builder, &format!("{name}_zp"), zero_points)?;

        let scaled = intermediate_like(builder, &format!("{name}_scaled"), input, DType::Float32)?;
        emit_mul(builder, &input.name, &inverse, &scaled.name)?;
        let shifted =
            intermediate_like(builder, &format!("{name}_shifted"), input, DType::Float32)?;
        builder.add_operator(
            TosaOp::Add,
            vec![scaled.name, zp],
            vec![shifted.name.clone()],
            Attribute::None,
        )?;
        let clamped =
            intermediate_like(builder, &format!("{name}_clamped"), input, DType::Float32)?;
        builder.add_operator(
            TosaOp::Clamp,
            vec![shifted.name],
            vec![clamped.name.clone()],
            Attribute::Clamp {
                min_int: params.qmin,
                max_int: params.qmax,
                min_fp: params.qmin as f64,
                max_fp: params.qmax as f64,
            },
        )?;
        builder.add_operator(
            TosaOp::Cast,
            vec![clamped.name],
            vec![name.clone()],
            Attribute::None,
        )?;
        Ok(())
    }
}

/// Dequantize on floating-point targets: `(cast(x) - zp) * scale`.
struct DequantizeVisitor;

impl NodeVisitor for DequantizeVisitor {
    fn target(&self) -> &'static str {
        quantized::DEQUANTIZE_PER_TENSOR
    }

    fn aliases(&self) -> &'static [&'static str] {
        &[quantized::DEQUANTIZE_PER_CHANNEL]
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
        let params = BoundaryParams::parse(node, &ops, input)?;
        let name = &output.name;

        let as_float =
            intermediate_like(builder, &format!("{name}_float"), input, DType::Float32)?;
        builder.add_operator(
            TosaOp::Cast,
            vec![input.name.clone()],
            vec![as_float.name.clone()],
            Attribute::None,
        )?;
        let zero_points = params.zero_points.clone();
        let zp = params.constant(builder, &format!("{name}_zp"), zero_points)?;
        let centered =
            intermediate_like(builder, &format!("{name}_centered"), input, DType::Float32)?;
        builder.add_operator(
            TosaOp::Sub,
            vec![as_float.name, zp],
            vec![centered.name.clone()],
            Attribute::None,
        )?;
        let scales = params.scales.clone();
        let scale = params.constant(builder, &format!("{name}_scale"), scales)?;
        emit_mul(builder, &centered.name, &scale, name)
    }
}

pub(super) fn register(registry: &mut VisitorRegistry) -> Result<()> {
    registry.register(Arc::new(RescaleVisitor))?;
    registry.register(Arc::new(TableVisitor))?;
    registry.register(Arc::new(QuantizeVisitor))?;
    registry.register(Arc::new(DequantizeVisitor))?;
    Ok(())
}
