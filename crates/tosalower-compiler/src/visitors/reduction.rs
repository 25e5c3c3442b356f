//! Reductions along axes and 2-D pooling.

use std::collections::BTreeSet;
use std::sync::Arc;

use tosalower_ir::ops::aten;
use tosalower_ir::{Attribute, DType, Node, TosaDType, TosaGraphBuilder, TosaOp, TosaSpecification};
use tracing::trace;

use super::conv2d::adjust_pad_if_needed;
use super::quant::{rescale_from_int32, rescale_to_int32, unary_qparams};
use super::{
    emit_view, intermediate_like, specs, NodeVisitor, Operands, TensorArg, TosaArg, VisitorRegistry,
};
use crate::error::{LoweringError, Result};
use crate::passes::shape::NHWC_ORDER;

/// Declare the keep-dim result of reducing `from` along `axis`.
fn reduced(
    builder: &mut TosaGraphBuilder,
    hint: &str,
    from: &TensorArg,
    axis: usize,
    dtype: DType,
) -> Result<TensorArg> {
    let mut shape = from.shape.clone();
    shape[axis] = 1;
    let t = TensorArg {
        name: String::new(),
        shape,
        dtype,
        dim_order: from.dim_order.clone(),
    };
    let name = builder.add_intermediate(hint, &t.physical_shape(), TosaDType::from_dtype(dtype)?);
    Ok(TensorArg { name, ..t })
}

/// Sorted, deduplicated axes of `dims`; every axis when empty.
fn reduction_axes(node: &Node, dims: &[i64], rank: usize) -> Result<Vec<usize>> {
    if dims.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut axes = BTreeSet::new();
    for &d in dims {
        let axis = if d < 0 { d + rank as i64 } else { d };
        if !(0..rank as i64).contains(&axis) {
            return Err(LoweringError::invalid_argument(
                &node.name,
                format!("reduction dim {d} is out of range for rank {rank}"),
            ));
        }
        axes.insert(axis as usize);
    }
    Ok(axes.into_iter().collect())
}

/// `target(input, dims, keepdim)` lowered to one `REDUCE_*` per axis.
struct Reduce {
    target: &'static str,
    op: TosaOp,
}

const REDUCTIONS: &[Reduce] = &[
    Reduce {
        target: aten::SUM,
        op: TosaOp::ReduceSum,
    },
    Reduce {
        target: aten::AMAX,
        op: TosaOp::ReduceMax,
    },
    Reduce {
        target: aten::AMIN,
        op: TosaOp::ReduceMin,
    },
    Reduce {
        target: aten::ANY_DIMS,
        op: TosaOp::ReduceAny,
    },
];

impl Reduce {
    /// Quantized sums accumulate in int32: returns the widened input and the
    /// scale and zero point of the final rescale.
    fn widen(
        &self,
        node: &Node,
        builder: &mut TosaGraphBuilder,
        input: &TensorArg,
    ) -> Result<Option<(TensorArg, f64, i64)>> {
        if self.op != TosaOp::ReduceSum || input.dtype != DType::Int8 {
            return Ok(None);
        }
        let Some((input_q, output_q)) = unary_qparams(node) else {
            return Ok(None);
        };
        let input_scale = input_q.scale_per_tensor()?;
        let output_scale = output_q.scale_per_tensor()?;
        if output_scale == 0.0 {
            return Err(LoweringError::invalid_argument(&node.name, "output scale is zero"));
        }
        let wide = rescale_to_int32(builder, input, input_q.zp_per_tensor()?, 1.0)?;
        Ok(Some((wide, input_scale / output_scale, output_q.zp_per_tensor()?)))
    }
}

impl NodeVisitor for Reduce {
    fn target(&self) -> &'static str {
        self.target
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
        let dims = if ops.is_none(1) { &[][..] } else { ops.ints(1)? };
        let axes = reduction_axes(node, dims, input.rank())?;
        let keepdim = ops.bool_or(2, false)?;
        let widened = self.widen(node, builder, input)?;
        let quantized = widened.is_some();
        trace!(node = %node.name, op = ?self.op, ?axes, keepdim, quantized, "reduction");

        let mut current = widened
            .as_ref()
            .map_or_else(|| input.clone(), |(wide, _, _)| wide.clone());
        if axes.is_empty() {
            return emit_view(builder, &current, output);
        }
        // The last reduction writes the output directly when nothing follows.
        let direct = keepdim && widened.is_none();
        for (i, &axis) in axes.iter().enumerate() {
            let next = if direct && i + 1 == axes.len() {
                output.clone()
            } else {
                let hint = format!("{}_{}", output.name, axis);
                reduced(builder, &hint, &current, axis, current.dtype)?
            };
            builder.add_operator(
                self.op,
                vec![current.name.clone()],
                vec![next.name.clone()],
                Attribute::Axis {
                    axis: current.physical_axis(axis) as i64,
                },
            )?;
            current = next;
        }

        if let Some((_, scale, output_zp)) = widened {
            let narrow = if keepdim {
                output.clone()
            } else {
                let hint = format!("{}_keepdim", output.name);
                intermediate_like(builder, &hint, &current, output.dtype)?
            };
            rescale_from_int32(builder, &current, &narrow, &[scale], output_zp)?;
            current = narrow;
        }
        if !keepdim {
            emit_view(builder, &current, output)?;
        }
        Ok(())
    }
}

/// Kernel, stride and padding of a 2-D pool with the trailing pad of each
/// spatial dimension adjusted.
struct Window {
    kernel: Vec<i64>,
    stride: Vec<i64>,
    pad: Vec<i64>,
}

fn per_dim(values: &[i64], d: usize, default: i64) -> i64 {
    values.get(d).or(values.first()).copied().unwrap_or(default)
}

fn pool_window(node: &Node, ops: &Operands<'_>, input: &TensorArg) -> Result<Window> {
    if input.rank() != 4 || input.dim_order.as_deref() != Some(&NHWC_ORDER[..]) {
        return Err(LoweringError::invalid_argument(
            &node.name,
            format!("pooling expects a channels-last rank-4 input, got {:?}", input.shape),
        ));
    }
    let kernel = ops.ints(1)?;
    let stride = match ops.get(2) {
        Some(TosaArg::Ints(s)) if !s.is_empty() => s.as_slice(),
        _ => kernel,
    };
    let padding = match ops.get(3) {
        Some(TosaArg::Ints(p)) => p.as_slice(),
        _ => &[],
    };
    let mut window = Window {
        kernel: Vec::with_capacity(2),
        stride: Vec::with_capacity(2),
        pad: Vec::with_capacity(4),
    };
    for d in 0..2 {
        let (k, s, p) = (per_dim(kernel, d, 1), per_dim(stride, d, 1), per_dim(padding, d, 0));
        let adjusted = adjust_pad_if_needed(&node.name, input.shape[2 + d] as i64, k, s, p, 1)?;
        window.kernel.push(k);
        window.stride.push(s);
        window.pad.extend([p, adjusted]);
    }
    Ok(window)
}

fn pool_zero_points(node: &Node, input: &TensorArg) -> Result<(i64, i64)> {
    if input.dtype != DType::Int8 {
        return Ok((0, 0));
    }
    match unary_qparams(node) {
        Some((input_q, output_q)) => Ok((input_q.zp_per_tensor()?, output_q.zp_per_tensor()?)),
        None => Ok((0, 0)),
    }
}

/// `avg_pool2d(input, kernel, stride, padding, ceil_mode, count_include_pad,
/// divisor_override)`.
struct AvgPool2dVisitor;

impl NodeVisitor for AvgPool2dVisitor {
    fn target(&self) -> &'static str {
        aten::AVG_POOL2D
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
        if ops.bool_or(4, false)? {
            return Err(LoweringError::invalid_argument(&node.name, "ceil_mode is not supported"));
        }
        if !ops.is_none(6) {
            return Err(LoweringError::invalid_argument(
                &node.name,
                "divisor_override is not supported",
            ));
        }
        let window = pool_window(node, &ops, input)?;
        let (input_zp, output_zp) = pool_zero_points(node, input)?;
        let acc_type = if input.dtype.is_float() {
            TosaDType::Fp32
        } else {
            TosaDType::Int32
        };
        builder.add_operator(
            TosaOp::AvgPool2d,
            vec![input.name.clone()],
            vec![output.name.clone()],
            Attribute::Pool {
                kernel: window.kernel,
                stride: window.stride,
                pad: window.pad,
                input_zp,
                output_zp,
                acc_type: Some(acc_type),
            },
        )?;
        Ok(())
    }
}

/// `max_pool2d(input, kernel, stride, padding, dilation, ceil_mode)`.
struct MaxPool2dVisitor;

impl NodeVisitor for MaxPool2dVisitor {
    fn target(&self) -> &'static str {
        aten::MAX_POOL2D
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
        if let Some(TosaArg::Ints(dilation)) = ops.get(4) {
            if dilation.iter().any(|&d| d != 1) {
                return Err(LoweringError::invalid_argument(
                    &node.name,
                    format!("dilation {dilation:?} is not supported"),
                ));
            }
        }
        if ops.bool_or(5, false)? {
            return Err(LoweringError::invalid_argument(&node.name, "ceil_mode is not supported"));
        }
        let window = pool_window(node, &ops, input)?;
        builder.add_operator(
            TosaOp::MaxPool2d,
            vec![input.name.clone()],
            vec![output.name.clone()],
            Attribute::Pool {
                kernel: window.kernel,
                stride: window.stride,
                pad: window.pad,
                input_zp: 0,
                output_zp: 0,
                acc_type: None,
            },
        )?;
        Ok(())
    }
}

pub(super) fn register(registry: &mut VisitorRegistry) -> Result<()> {
    for reduce in REDUCTIONS {
        registry.register(Arc::new(Reduce {
            target: reduce.target,
            op: reduce.op,
        }))?;
    }
    registry.register(Arc::new(AvgPool2dVisitor))?;
    registry.register(Arc::new(MaxPool2dVisitor))?;
    Ok(())
}
