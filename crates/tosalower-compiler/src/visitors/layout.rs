//! Data movement: views, permutations, slices, concatenation, tiling and
//! padding.
//!
//! Axes and permutations arrive in logical terms and are mapped onto the
//! physical layout of the operands before emission.

use std::sync::Arc;

use tosalower_ir::ops::aten;
use tosalower_ir::tosa::shape_to_i64;
use tosalower_ir::{
    Attribute, Node, TensorData, TosaDType, TosaGraphBuilder, TosaOp, TosaSpecification,
};

use super::{
    emit_transpose, emit_view, invert, shape_const, specs, NodeVisitor, Operands, TensorArg,
    TosaArg, VisitorRegistry,
};
use crate::error::{LoweringError, Result};

/// Logical order of `t`, the identity when unset.
fn order_of(t: &TensorArg) -> Vec<usize> {
    t.dim_order.clone().unwrap_or_else(|| (0..t.rank()).collect())
}

fn normalize_axis(node: &Node, axis: i64, rank: usize) -> Result<usize> {
    let rank = rank as i64;
    let wrapped = if axis < 0 { axis + rank } else { axis };
    if !(0..rank.max(1)).contains(&wrapped) {
        return Err(LoweringError::invalid_argument(
            &node.name,
            format!("axis {axis} is out of range for rank {rank}"),
        ));
    }
    Ok(wrapped as usize)
}

/// `view_copy(input, shape)`.
struct ViewVisitor;

impl NodeVisitor for ViewVisitor {
    fn target(&self) -> &'static str {
        aten::VIEW
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
        emit_view(builder, input, output)
    }
}

/// Physical `TRANSPOSE` permutation of a logical permute `perm` between
/// the layouts of `input` and `output`.
pub(crate) fn physical_permutation(
    input: &TensorArg,
    output: &TensorArg,
    perm: &[usize],
) -> Vec<usize> {
    let inverse_in = invert(&order_of(input));
    order_of(output)
        .into_iter()
        .map(|d| inverse_in[perm[d]])
        .collect()
}

/// `permute_copy(input, perm)`.
struct PermuteVisitor;

impl NodeVisitor for PermuteVisitor {
    fn target(&self) -> &'static str {
        aten::PERMUTE
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
        let perm = ops
            .ints(1)?
            .iter()
            .map(|&p| normalize_axis(node, p, input.rank()))
            .collect::<Result<Vec<_>>>()?;
        if perm.len() != input.rank() {
            return Err(LoweringError::invalid_argument(
                &node.name,
                format!("permutation {perm:?} does not match rank {}", input.rank()),
            ));
        }
        let physical = physical_permutation(input, output, &perm);
        emit_transpose(builder, &input.name, &output.name, &physical)
    }
}

/// `slice_copy(input, dim, start, end, step)` with unit step.
struct SliceVisitor;

impl NodeVisitor for SliceVisitor {
    fn target(&self) -> &'static str {
        aten::SLICE
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
        let dim = normalize_axis(node, ops.int_or(1, 0)?, input.rank())?;
        if ops.int_or(4, 1)? != 1 {
            return Err(LoweringError::invalid_argument(&node.name, "slice step must be 1"));
        }
        let extent = input.shape[dim] as i64;
        let clamp = |v: i64| if v < 0 { (v + extent).max(0) } else { v.min(extent) };
        let start = clamp(ops.int_or(2, 0)?);
        let end = clamp(ops.int_or(3, extent)?).max(start);

        let axis = input.physical_axis(dim);
        let mut begin = vec![0; input.rank()];
        begin[axis] = start;
        let mut size = shape_to_i64(&input.physical_shape());
        size[axis] = end - start;

        let (operands, attribute) = if builder.spec().is_legacy() {
            (
                vec![input.name.clone()],
                Attribute::Slice { start: begin, size },
            )
        } else {
            let start = shape_const(builder, &format!("{}_start", output.name), &begin)?;
            let size = shape_const(builder, &format!("{}_size", output.name), &size)?;
            (vec![input.name.clone(), start, size], Attribute::None)
        };
        builder.add_operator(TosaOp::Slice, operands, vec![output.name.clone()], attribute)?;
        Ok(())
    }
}

/// `cat(tensors, dim)`.
struct CatVisitor;

impl NodeVisitor for CatVisitor {
    fn target(&self) -> &'static str {
        aten::CAT
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
        let tensors = ops.tensors(0)?;
        let dim = normalize_axis(node, ops.int_or(1, 0)?, output.rank())?;
        if let Some(t) = tensors.iter().find(|t| order_of(t) != order_of(output)) {
            return Err(LoweringError::invalid_argument(
                &node.name,
                format!("{} is laid out differently from the concatenation", t.name),
            ));
        }
        builder.add_operator(
            TosaOp::Concat,
            tensors.iter().map(|t| t.name.clone()).collect(),
            vec![output.name.clone()],
            Attribute::Axis {
                axis: output.physical_axis(dim) as i64,
            },
        )?;
        Ok(())
    }
}

/// `repeat(input, multiples)` as `TILE`.
struct RepeatVisitor;

impl NodeVisitor for RepeatVisitor {
    fn target(&self) -> &'static str {
        aten::REPEAT
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
        let multiples = ops.ints(1)?;
        if multiples.len() != input.rank() {
            return Err(LoweringError::invalid_argument(
                &node.name,
                format!("{} multiples for a rank-{} input", multiples.len(), input.rank()),
            ));
        }
        let physical: Vec<i64> = order_of(input).iter().map(|&d| multiples[d]).collect();
        let (operands, attribute) = if builder.spec().is_legacy() {
            (
                vec![input.name.clone()],
                Attribute::Tile {
                    multiples: physical,
                },
            )
        } else {
            let hint = format!("{}_multiples", output.name);
            let multiples = shape_const(builder, &hint, &physical)?;
            (vec![input.name.clone(), multiples], Attribute::None)
        };
        builder.add_operator(TosaOp::Tile, operands, vec![output.name.clone()], attribute)?;
        Ok(())
    }
}

/// `constant_pad_nd(input, pad, value)`.
///
/// `pad` lists `(before, after)` pairs starting from the last dimension.
struct ConstantPadVisitor;

impl ConstantPadVisitor {
    fn physical_padding(node: &Node, input: &TensorArg, pad: &[i64]) -> Result<Vec<i64>> {
        if pad.len() % 2 != 0 || pad.len() / 2 > input.rank() {
            return Err(LoweringError::invalid_argument(
                &node.name,
                format!("padding {pad:?} does not fit rank {}", input.rank()),
            ));
        }
        let mut logical = vec![(0, 0); input.rank()];
        for (i, pair) in pad.chunks(2).enumerate() {
            logical[input.rank() - 1 - i] = (pair[0], pair[1]);
        }
        Ok(order_of(input)
            .into_iter()
            .flat_map(|d| [logical[d].0, logical[d].1])
            .collect())
    }
}

impl NodeVisitor for ConstantPadVisitor {
    fn target(&self) -> &'static str {
        aten::CONSTANT_PAD_ND
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
        let padding = Self::physical_padding(node, input, ops.ints(1)?)?;
        let value = if ops.is_none(2) { 0.0 } else { ops.float(2)? };
        let (pad_const_int, pad_const_fp) = match node.input_qparams(0) {
            Some(params) => (params.quantize(value)?, 0.0),
            None if input.dtype.is_float() => (0, value),
            None => (value.round() as i64, 0.0),
        };

        let (operands, attribute) = if builder.spec().is_legacy() {
            let attribute = Attribute::Pad {
                padding,
                pad_const_int,
                pad_const_fp,
            };
            (vec![input.name.clone()], attribute)
        } else {
            let padding = shape_const(builder, &format!("{}_padding", output.name), &padding)?;
            let fill = if input.dtype.is_float() {
                pad_const_fp
            } else {
                pad_const_int as f64
            };
            let data = TensorData::full(input.dtype, vec![1], fill);
            let tosa_dtype = TosaDType::from_dtype(input.dtype)?;
            let fill = builder.add_const(&format!("{}_pad_const", output.name), tosa_dtype, data);
            (vec![input.name.clone(), padding, fill], Attribute::None)
        };
        builder.add_operator(TosaOp::Pad, operands, vec![output.name.clone()], attribute)?;
        Ok(())
    }
}

pub(super) fn register(registry: &mut VisitorRegistry) -> Result<()> {
    registry.register(Arc::new(ViewVisitor))?;
    registry.register(Arc::new(PermuteVisitor))?;
    registry.register(Arc::new(SliceVisitor))?;
    registry.register(Arc::new(CatVisitor))?;
    registry.register(Arc::new(RepeatVisitor))?;
    registry.register(Arc::new(ConstantPadVisitor))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::shape::NHWC_ORDER;
    use tosalower_ir::{Arg, DType, ValueId};

    fn nhwc(name: &str, shape: Vec<usize>, dtype: DType) -> TensorArg {
        TensorArg::new(name, shape, dtype).with_dim_order(NHWC_ORDER.to_vec())
    }

    fn declare(builder: &mut TosaGraphBuilder, t: &TensorArg) {
        let dtype = TosaDType::from_dtype(t.dtype).unwrap();
        builder.add_tensor(&t.name, &t.physical_shape(), dtype).unwrap();
    }

    fn run(
        visitor: &dyn NodeVisitor,
        spec: &str,
        inputs: Vec<TosaArg>,
        output: &TensorArg,
    ) -> TosaGraphBuilder {
        let mut builder = TosaGraphBuilder::new(spec.parse().unwrap());
        for arg in &inputs {
            match arg {
                TosaArg::Tensor(t) => declare(&mut builder, t),
                TosaArg::Tensors(ts) => ts.iter().for_each(|t| declare(&mut builder, t)),
                _ => {}
            }
        }
        declare(&mut builder, output);
        let node = Node::new("n", visitor.target(), vec![Arg::None], vec![ValueId(0)]);
        visitor.define_node(&node, &mut builder, &inputs, output).unwrap();
        builder
    }

    #[test]
    fn test_permute_between_layouts() {
        // NCHW -> NHWC permute of a channels-last value into a plain rank-4 value
        let x = nhwc("x", vec![1, 3, 4, 5], DType::Float32);
        let y = TensorArg::new("y", vec![1, 4, 5, 3], DType::Float32);
        assert_eq!(physical_permutation(&x, &y, &[0, 2, 3, 1]), vec![0, 1, 2, 3]);

        let plain = TensorArg::new("p", vec![2, 3, 4], DType::Float32);
        let out = TensorArg::new("q", vec![4, 2, 3], DType::Float32);
        assert_eq!(physical_permutation(&plain, &out, &[2, 0, 1]), vec![2, 0, 1]);
    }

    #[test]
    fn test_slice_uses_physical_axis() {
        let x = nhwc("x", vec![1, 4, 6, 6], DType::Int8);
        let y = nhwc("y", vec![1, 2, 6, 6], DType::Int8);
        let inputs = vec![
            TosaArg::Tensor(x),
            TosaArg::Int(1),
            TosaArg::Int(1),
            TosaArg::Int(-1),
            TosaArg::Int(1),
        ];
        let b = run(&SliceVisitor, "TOSA-0.80+BI", inputs, &y);
        match &b.operators()[0].attribute {
            Attribute::Slice { start, size } => {
                assert_eq!(start, &vec![0, 0, 0, 1]);
                assert_eq!(size, &vec![1, 6, 6, 2]);
            }
            other => panic!("unexpected attribute {other:?}"),
        }
    }

    #[test]
    fn test_v1_slice_takes_shape_operands() {
        let x = TensorArg::new("x", vec![8], DType::Int32);
        let y = TensorArg::new("y", vec![3], DType::Int32);
        let inputs = vec![
            TosaArg::Tensor(x),
            TosaArg::Int(0),
            TosaArg::Int(2),
            TosaArg::Int(5),
            TosaArg::Int(1),
        ];
        let b = run(&SliceVisitor, "TOSA-1.0+INT", inputs, &y);
        assert_eq!(b.operators()[0].inputs, vec!["x", "y_start", "y_size"]);
        let size = b.tensor("y_size").unwrap();
        assert_eq!(size.dtype, TosaDType::Shape);
        assert_eq!(size.data.as_ref().unwrap().to_i64_vec(), vec![3]);
    }

    #[test]
    fn test_cat_on_channels() {
        let a = nhwc("a", vec![1, 2, 4, 4], DType::Float32);
        let c = nhwc("c", vec![1, 3, 4, 4], DType::Float32);
        let y = nhwc("y", vec![1, 5, 4, 4], DType::Float32);
        let inputs = vec![TosaArg::Tensors(vec![a, c]), TosaArg::Int(1)];
        let b = run(&CatVisitor, "TOSA-1.0+FP", inputs, &y);
        assert_eq!(b.operators()[0].attribute, Attribute::Axis { axis: 3 });
    }

    #[test]
    fn test_repeat_multiples_follow_layout() {
        let x = nhwc("x", vec![1, 2, 1, 1], DType::Float32);
        let y = nhwc("y", vec![1, 2, 3, 4], DType::Float32);
        let inputs = vec![TosaArg::Tensor(x), TosaArg::Ints(vec![1, 1, 3, 4])];
        let b = run(&RepeatVisitor, "TOSA-0.80+MI", inputs, &y);
        assert_eq!(
            b.operators()[0].attribute,
            Attribute::Tile {
                multiples: vec![1, 3, 4, 1]
            }
        );
    }

    #[test]
    fn test_pad_pairs_map_to_physical_order() {
        let node = Node::new("p", aten::CONSTANT_PAD_ND, vec![], vec![]);
        let x = nhwc("x", vec![1, 2, 4, 4], DType::Int8);
        let padding = ConstantPadVisitor::physical_padding(&node, &x, &[1, 1, 2, 2]).unwrap();
        // W padded by 1 and H by 2, listed in NHWC order
        assert_eq!(padding, vec![0, 0, 2, 2, 1, 1, 0, 0]);
        assert!(ConstantPadVisitor::physical_padding(&node, &x, &[1]).is_err());
    }

    #[test]
    fn test_v1_pad_fill_is_a_tensor() {
        let x = TensorArg::new("x", vec![2, 3], DType::Float32);
        let y = TensorArg::new("y", vec![2, 5], DType::Float32);
        let inputs = vec![TosaArg::Tensor(x), TosaArg::Ints(vec![1, 1]), TosaArg::Float(0.5)];
        let b = run(&ConstantPadVisitor, "TOSA-1.0+FP", inputs, &y);
        assert_eq!(b.operators()[0].inputs, vec!["x", "y_padding", "y_pad_const"]);
        let padding = b.tensor("y_padding").unwrap().data.as_ref().unwrap().to_i64_vec();
        assert_eq!(padding, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_legacy_pad_attribute() {
        let x = TensorArg::new("x", vec![4], DType::Int32);
        let y = TensorArg::new("y", vec![7], DType::Int32);
        let inputs = vec![TosaArg::Tensor(x), TosaArg::Ints(vec![2, 1]), TosaArg::Int(-3)];
        let b = run(&ConstantPadVisitor, "TOSA-0.80+BI", inputs, &y);
        assert_eq!(
            b.operators()[0].attribute,
            Attribute::Pad {
                padding: vec![2, 1],
                pad_const_int: -3,
                pad_const_fp: 0.0,
            }
        );
    }
}
