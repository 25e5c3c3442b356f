//! `aten.convolution` as `CONV2D` or `DEPTHWISE_CONV2D`.
//!
//! Both dialects share the lowering below; they differ in how zero points
//! reach the operator (attributes on 0.80, constant operands on 1.0) and in
//! the rounding of the final rescale.

use tosalower_ir::ops::aten;
use tosalower_ir::{
    Attribute, DType, Node, QuantArgs, TosaDType, TosaGraphBuilder, TosaOp, TosaSpecification,
};
use tracing::trace;

use super::quant::emit_rescale;
use super::{emit_reshape, specs, zero_point_const, NodeVisitor, Operands, TensorArg, TosaArg};
use crate::error::{LoweringError, Result};
use crate::passes::shape::{is_depthwise_channels, window_remainder};

/// Trailing padding that makes a window tile `input_size` exactly.
///
/// TOSA requires `(input + 2*pad - dilation*(kernel-1) - 1) % stride == 0`.
/// The trailing pad is reduced by the remainder; a remainder larger than the
/// pad means the input was never size-adjusted.
///
/// ```
/// use tosalower_compiler::visitors::adjust_pad_if_needed;
///
/// assert_eq!(adjust_pad_if_needed("conv", 8, 3, 2, 1, 1).unwrap(), 0);
/// assert!(adjust_pad_if_needed("conv", 8, 3, 2, 0, 1).is_err());
/// ```
pub fn adjust_pad_if_needed(
    node: &str,
    input_size: i64,
    kernel: i64,
    stride: i64,
    pad: i64,
    dilation: i64,
) -> Result<i64> {
    let remainder = window_remainder(input_size, pad, kernel, stride, dilation);
    if remainder == 0 {
        return Ok(pad);
    }
    if remainder > pad {
        return Err(LoweringError::InvalidPadding {
            node: node.to_string(),
            input_size,
            kernel,
            stride,
            pad,
            dilation,
            remainder,
        });
    }
    Ok(pad - remainder)
}

/// Rescale factors `input_scale * weight_scale / output_scale`, one per
/// output channel for per-channel weights.
pub fn conv_rescale_scales(
    input: &QuantArgs,
    weight: &QuantArgs,
    output: &QuantArgs,
) -> Result<Vec<f64>> {
    let input_scale = input.scale_per_tensor()?;
    let output_scale = output.scale_per_tensor()?;
    if output_scale == 0.0 {
        return Err(LoweringError::invalid_argument("convolution", "output scale is zero"));
    }
    Ok(weight
        .scale_per_channel()
        .iter()
        .map(|w| input_scale * w / output_scale)
        .collect())
}

fn is_quantized_int(dtype: DType) -> bool {
    matches!(dtype, DType::Int8 | DType::Int16)
}

/// Zero point of quantized slot `slot`, zero for float operands.
fn zero_point(node: &Node, slot: usize, dtype: DType) -> Result<i64> {
    if !is_quantized_int(dtype) {
        return Ok(0);
    }
    let params = node.input_qparams(slot).ok_or_else(|| {
        LoweringError::invalid_argument(
            &node.name,
            format!("quantized operand {slot} has no quantization parameters"),
        )
    })?;
    Ok(params.zero_points.first().copied().unwrap_or(0))
}

fn accumulator(input: DType) -> Result<TosaDType> {
    match input {
        DType::Int16 => Ok(TosaDType::Int48),
        d if d.is_float() => Ok(TosaDType::from_dtype(d)?),
        _ => Ok(TosaDType::Int32),
    }
}

/// Per-dimension entry `d`, broadcasting a single value.
fn spatial(values: &[i64], d: usize, default: i64) -> i64 {
    values.get(d).or(values.first()).copied().unwrap_or(default)
}

fn define_convolution(
    node: &Node,
    builder: &mut TosaGraphBuilder,
    inputs: &[TosaArg],
    output: &TensorArg,
) -> Result<()> {
    let ops = Operands::new(node, inputs);
    let input = ops.tensor(0)?;
    let weight = ops.tensor(1)?;
    let bias = ops.optional_tensor(2).ok_or_else(|| {
        LoweringError::invalid_argument(&node.name, "convolution reached lowering without a bias")
    })?;
    let stride = ops.ints(3)?;
    let padding = ops.ints(4)?;
    let dilation = ops.ints(5)?;
    if ops.bool_or(6, false)? {
        return Err(LoweringError::invalid_argument(
            &node.name,
            "transposed convolution is not supported",
        ));
    }
    let groups = ops.int_or(8, 1)?;
    if input.rank() != 4 || weight.rank() != 4 {
        return Err(LoweringError::invalid_argument(
            &node.name,
            format!("expected rank-4 operands, got {:?} and {:?}", input.shape, weight.shape),
        ));
    }

    // Padding is [top, bottom, left, right]; only the trailing side shrinks.
    let mut pad = Vec::with_capacity(4);
    for d in 0..2 {
        let p = spatial(padding, d, 0);
        let adjusted = adjust_pad_if_needed(
            &node.name,
            input.shape[2 + d] as i64,
            weight.shape[2 + d] as i64,
            spatial(stride, d, 1),
            p,
            spatial(dilation, d, 1),
        )?;
        pad.extend([p, adjusted]);
    }
    let stride = vec![spatial(stride, 0, 1), spatial(stride, 1, 1)];
    let dilation = vec![spatial(dilation, 0, 1), spatial(dilation, 1, 1)];

    let input_zp = zero_point(node, 0, input.dtype)?;
    let weight_zp = zero_point(node, 1, weight.dtype)?;
    let acc_type = accumulator(input.dtype)?;

    let rescale = is_quantized_int(output.dtype);
    let result = if rescale {
        let hint = format!("{}_conv", output.name);
        let name = builder.add_intermediate(&hint, &output.physical_shape(), acc_type);
        TensorArg {
            name,
            shape: output.shape.clone(),
            dtype: DType::Int32,
            dim_order: output.dim_order.clone(),
        }
    } else {
        output.clone()
    };

    let in_channels = input.shape[1];
    let out_channels = weight.shape[0];
    let (op, weight_name) = if is_depthwise_channels(in_channels, out_channels, groups) {
        let multiplier = out_channels / in_channels;
        let shape = [weight.shape[2], weight.shape[3], in_channels, multiplier];
        let weight_dtype = weight.tosa_dtype()?;
        let reshaped =
            builder.add_intermediate(&format!("{}_depthwise", weight.name), &shape, weight_dtype);
        emit_reshape(builder, &weight.name, &reshaped, &shape)?;
        (TosaOp::DepthwiseConv2d, reshaped)
    } else {
        (TosaOp::Conv2d, weight.name.clone())
    };
    trace!(node = %node.name, ?op, ?pad, rescale, "convolution");

    let legacy = builder.spec().is_legacy();
    let mut operands = vec![input.name.clone(), weight_name, bias.name.clone()];
    if !legacy {
        let name = &result.name;
        let izp = zero_point_const(builder, &format!("{name}_input_zp"), input.dtype, input_zp)?;
        let wzp =
            zero_point_const(builder, &format!("{name}_weight_zp"), weight.dtype, weight_zp)?;
        operands.extend([izp, wzp]);
    }
    let attribute = Attribute::Conv {
        pad,
        stride,
        dilation,
        input_zp: legacy.then_some(input_zp),
        weight_zp: legacy.then_some(weight_zp),
        acc_type: (!legacy).then_some(acc_type),
        local_bound: false,
    };
    builder.add_operator(op, operands, vec![result.name.clone()], attribute)?;

    if rescale {
        let qparams = |slot: usize, params: Option<&QuantArgs>| {
            params.cloned().ok_or_else(|| {
                LoweringError::invalid_argument(
                    &node.name,
                    format!("quantized convolution is missing parameters for slot {slot}"),
                )
            })
        };
        let input_q = qparams(0, node.input_qparams(0))?;
        let weight_q = qparams(1, node.input_qparams(1))?;
        let output_q = qparams(0, node.output_qparams(0))?;
        let scales = conv_rescale_scales(&input_q, &weight_q, &output_q)?;
        let output_zp = output_q.zp_per_tensor()?;
        emit_rescale(builder, &result, output, &scales, 0, output_zp)?;
    }
    Ok(())
}

/// Convolution for the 0.80 dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct Conv2dVisitor080;

impl NodeVisitor for Conv2dVisitor080 {
    fn target(&self) -> &'static str {
        aten::CONVOLUTION
    }

    fn tosa_specs(&self) -> Vec<TosaSpecification> {
        specs::legacy()
    }

    fn define_node(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        inputs: &[TosaArg],
        output: &TensorArg,
    ) -> Result<()> {
        define_convolution(node, builder, inputs, output)
    }
}

/// Convolution for the 1.0 dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct Conv2dVisitor;

impl NodeVisitor for Conv2dVisitor {
    fn target(&self) -> &'static str {
        aten::CONVOLUTION
    }

    fn tosa_specs(&self) -> Vec<TosaSpecification> {
        specs::v1()
    }

    fn define_node(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        inputs: &[TosaArg],
        output: &TensorArg,
    ) -> Result<()> {
        define_convolution(node, builder, inputs, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::shape::{DEPTHWISE_WEIGHT_ORDER, NHWC_ORDER};
    use approx::assert_relative_eq;
    use tosalower_ir::{Arg, RoundingMode, ValueId};

    #[test]
    fn test_pad_adjustment_table() {
        // (input, kernel, stride, dilation, pad) -> adjusted pad
        let cases = [
            ((8, 3, 2, 1, 1), Some(0)),
            ((7, 3, 2, 1, 1), Some(1)),
            ((9, 2, 2, 1, 1), Some(0)),
            ((16, 3, 1, 1, 1), Some(1)),
            ((10, 3, 3, 2, 2), Some(2)),
            ((11, 3, 3, 2, 2), Some(1)),
            ((8, 3, 2, 1, 0), None),
            ((9, 2, 2, 1, 0), None),
        ];
        for ((size, kernel, stride, dilation, pad), expected) in cases {
            let adjusted = adjust_pad_if_needed("conv", size, kernel, stride, pad, dilation);
            match expected {
                Some(p) => {
                    let p2 = adjusted.unwrap();
                    assert_eq!(p2, p, "{size} {kernel} {stride} {dilation} {pad}");
                    assert_eq!((size + pad + p2 - dilation * (kernel - 1) - 1) % stride, 0);
                }
                None => assert!(matches!(
                    adjusted,
                    Err(LoweringError::InvalidPadding { remainder: 1, .. })
                )),
            }
        }
    }

    #[test]
    fn test_pad_adjustment_is_idempotent() {
        let once = adjust_pad_if_needed("conv", 8, 3, 2, 1, 1).unwrap();
        let remainder = (8 + 1 + once - 2 - 1) % 2;
        assert_eq!(remainder, 0);
        assert_eq!(adjust_pad_if_needed("conv", 7, 3, 2, 1, 1).unwrap(), 1);
    }

    #[test]
    fn test_rescale_scales_per_channel() {
        let input = QuantArgs::int8(0.5, 0);
        let weight =
            QuantArgs::per_channel(vec![0.25, 0.5], vec![0, 0], 0, -127, 127, DType::Int8)
                .unwrap();
        let output = QuantArgs::int8(0.1, 0);
        let scales = conv_rescale_scales(&input, &weight, &output).unwrap();
        assert_eq!(scales.len(), 2);
        assert_relative_eq!(scales[0], 1.25, max_relative = 1e-12);
        assert_relative_eq!(scales[1], 2.5, max_relative = 1e-12);
    }

    struct Conv {
        node: Node,
        inputs: Vec<TosaArg>,
        output: TensorArg,
    }

    fn conv(
        builder: &mut TosaGraphBuilder,
        in_channels: usize,
        out_channels: usize,
        groups: usize,
        dtype: DType,
    ) -> Conv {
        let depthwise = is_depthwise_channels(in_channels, out_channels, groups as i64);
        let weight_order = if depthwise {
            DEPTHWISE_WEIGHT_ORDER
        } else {
            NHWC_ORDER
        };
        let input = TensorArg::new("x", vec![1, in_channels, 8, 8], dtype)
            .with_dim_order(NHWC_ORDER.to_vec());
        let weight = TensorArg::new("w", vec![out_channels, in_channels / groups, 3, 3], dtype)
            .with_dim_order(weight_order.to_vec());
        let bias_dtype = if dtype.is_float() { dtype } else { DType::Int32 };
        let bias = TensorArg::new("b", vec![out_channels], bias_dtype);
        let output = TensorArg::new("y", vec![1, out_channels, 6, 6], dtype)
            .with_dim_order(NHWC_ORDER.to_vec());
        for t in [&input, &weight, &bias, &output] {
            let tosa = TosaDType::from_dtype(t.dtype).unwrap();
            builder.add_tensor(&t.name, &t.physical_shape(), tosa).unwrap();
        }

        let mut node = Node::new(
            "conv",
            aten::CONVOLUTION,
            vec![
                Arg::Value(ValueId(0)),
                Arg::Value(ValueId(1)),
                Arg::Value(ValueId(2)),
                Arg::Ints(vec![1, 1]),
                Arg::Ints(vec![0, 0]),
                Arg::Ints(vec![1, 1]),
                Arg::Bool(false),
                Arg::Ints(vec![0, 0]),
                Arg::Int(groups as i64),
            ],
            vec![ValueId(3)],
        );
        if dtype == DType::Int8 {
            node.annotate_input(0, QuantArgs::int8(0.5, -1)).unwrap();
            let weight_q = QuantArgs::per_channel(
                vec![0.25; out_channels],
                vec![0; out_channels],
                0,
                -127,
                127,
                DType::Int8,
            )
            .unwrap();
            node.annotate_input(1, weight_q).unwrap();
            node.annotate_output(0, QuantArgs::int8(0.1, 3)).unwrap();
        }
        let inputs = vec![
            TosaArg::Tensor(input),
            TosaArg::Tensor(weight),
            TosaArg::Tensor(bias),
            TosaArg::Ints(vec![1, 1]),
            TosaArg::Ints(vec![0, 0]),
            TosaArg::Ints(vec![1, 1]),
            TosaArg::Bool(false),
            TosaArg::Ints(vec![0, 0]),
            TosaArg::Int(groups as i64),
        ];
        Conv {
            node,
            inputs,
            output,
        }
    }

    fn lower(
        spec: &str,
        in_channels: usize,
        out_channels: usize,
        groups: usize,
        dtype: DType,
    ) -> TosaGraphBuilder {
        let mut builder = TosaGraphBuilder::new(spec.parse().unwrap());
        let c = conv(&mut builder, in_channels, out_channels, groups, dtype);
        define_convolution(&c.node, &mut builder, &c.inputs, &c.output).unwrap();
        builder
    }

    #[test]
    fn test_depthwise_reshapes_weight() {
        let b = lower("TOSA-1.0+INT", 8, 16, 8, DType::Int8);
        let reshape = b.operators().iter().find(|op| op.op == TosaOp::Reshape).unwrap();
        assert_eq!(reshape.inputs[0], "w");
        let reshaped = b.tensor(&reshape.outputs[0]).unwrap();
        assert_eq!(reshaped.shape, vec![3, 3, 8, 2]);
        let conv = b
            .operators()
            .iter()
            .find(|op| op.op == TosaOp::DepthwiseConv2d)
            .unwrap();
        assert_eq!(conv.inputs[1], reshape.outputs[0]);
    }

    #[test]
    fn test_standard_conv_keeps_weight() {
        let b = lower("TOSA-1.0+FP", 8, 16, 1, DType::Float32);
        assert!(b.operators().iter().all(|op| op.op != TosaOp::Reshape));
        let conv = &b.operators()[0];
        assert_eq!(conv.op, TosaOp::Conv2d);
        assert_eq!(conv.inputs[1], "w");
        assert_eq!(conv.outputs, vec!["y"]);
    }

    #[test]
    fn test_float_output_skips_rescale() {
        for spec in ["TOSA-0.80+MI", "TOSA-1.0+FP"] {
            let b = lower(spec, 8, 16, 1, DType::Float32);
            assert!(b.operators().iter().all(|op| op.op != TosaOp::Rescale), "{spec}");
        }
    }

    #[test]
    fn test_v1_quantized_conv() {
        let b = lower("TOSA-1.0+INT", 4, 2, 1, DType::Int8);
        let ops = b.operators();
        assert_eq!(ops.len(), 2);
        let conv = &ops[0];
        assert_eq!(conv.inputs.len(), 5);
        let izp = b.tensor(&conv.inputs[3]).unwrap();
        assert_eq!(izp.data.as_ref().unwrap().to_i64_vec(), vec![-1]);
        assert_eq!(izp.dtype, TosaDType::Int8);
        match &conv.attribute {
            Attribute::Conv {
                input_zp,
                acc_type,
                pad,
                ..
            } => {
                assert_eq!(*input_zp, None);
                assert_eq!(*acc_type, Some(TosaDType::Int32));
                assert_eq!(pad, &vec![0, 0, 0, 0]);
            }
            other => panic!("unexpected attribute {other:?}"),
        }
        let staged = b.tensor(&conv.outputs[0]).unwrap();
        assert_eq!(staged.dtype, TosaDType::Int32);
        assert_eq!(staged.shape, vec![1, 6, 6, 2]);

        let rescale = &ops[1];
        assert_eq!(rescale.op, TosaOp::Rescale);
        assert_eq!(rescale.inputs[0], conv.outputs[0]);
        assert_eq!(rescale.outputs, vec!["y"]);
        let output_zp = b.tensor(&rescale.inputs[4]).unwrap();
        assert_eq!(output_zp.data.as_ref().unwrap().to_i64_vec(), vec![3]);
        assert!(matches!(
            rescale.attribute,
            Attribute::Rescale {
                rounding_mode: RoundingMode::SingleRound,
                per_channel: true,
                ..
            }
        ));
    }

    #[test]
    fn test_legacy_quantized_conv() {
        let b = lower("TOSA-0.80+BI", 4, 2, 1, DType::Int8);
        let ops = b.operators();
        assert_eq!(ops[0].inputs, vec!["x", "w", "b"]);
        assert!(matches!(
            ops[0].attribute,
            Attribute::Conv {
                input_zp: Some(-1),
                weight_zp: Some(0),
                acc_type: None,
                ..
            }
        ));
        match &ops[1].attribute {
            Attribute::Rescale {
                multiplier,
                shift,
                output_zp,
                rounding_mode,
                ..
            } => {
                assert_eq!(multiplier, &vec![1342177280, 1342177280]);
                assert_eq!(shift, &vec![30, 30]);
                assert_eq!(*output_zp, Some(3));
                assert_eq!(*rounding_mode, RoundingMode::DoubleRound);
            }
            other => panic!("unexpected attribute {other:?}"),
        }
    }

    #[test]
    fn test_transposed_is_rejected() {
        let mut builder = TosaGraphBuilder::new("TOSA-1.0+FP".parse().unwrap());
        let mut c = conv(&mut builder, 2, 2, 1, DType::Float32);
        c.inputs[6] = TosaArg::Bool(true);
        let err = define_convolution(&c.node, &mut builder, &c.inputs, &c.output).unwrap_err();
        assert!(matches!(err, LoweringError::InvalidArgument { .. }));
    }
}
