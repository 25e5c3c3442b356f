//! One-to-one and one-to-few operator conversions.

use tosalower_ir::ops::aten;
use tosalower_ir::{Arg, DType, Graph, Node};

use super::util::{
    self, binary, full_scalar, int_arg, ints_arg, move_before_dequant, normalize_dim, retarget,
    rewrite_each, to_ints, value_arg, view,
};
use super::{GraphPass};
use crate::error::{LoweringError, Result};

unit_pass!(
    /// `max_pool2d_with_indices` whose indices are unused becomes `max_pool2d`.
    RemoveGetItemPass
);

impl GraphPass for RemoveGetItemPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::MAX_POOL2D_WITH_INDICES], |graph, node| {
            if let Some(&indices) = node.outputs.get(1) {
                if !graph.users(indices).is_empty() || graph.is_output(indices) {
                    return Err(LoweringError::legalization(
                        Self::NAME,
                        &node.name,
                        "pooling indices are consumed",
                    ));
                }
            }
            let mut pool = retarget(node, aten::MAX_POOL2D, node.args.clone());
            pool.outputs.truncate(1);
            Ok(Some(vec![pool]))
        })
    }
}

unit_pass!(
    /// `split_with_sizes` becomes one `slice` per output.
    ConvertSplitToSlicePass
);

impl GraphPass for ConvertSplitToSlicePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SPLIT], |graph, node| {
            let input = value_arg(Self::NAME, node, 0)?;
            let sizes = ints_arg(Self::NAME, node, 1)?;
            let rank = graph.shape(input).len();
            let dim = normalize_dim(Self::NAME, node, node.int_arg(2).unwrap_or(0), rank)?;
            if sizes.len() != node.outputs.len() {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    format!("{} split sizes for {} outputs", sizes.len(), node.outputs.len()),
                ));
            }
            let mut start = 0;
            let mut slices = Vec::with_capacity(sizes.len());
            for (size, &out) in sizes.iter().zip(&node.outputs) {
                let name = graph.fresh_name(&format!("{}_slice", node.name));
                slices.push(Node::new(
                    name,
                    aten::SLICE,
                    vec![
                        Arg::Value(input),
                        Arg::Int(dim as i64),
                        Arg::Int(start),
                        Arg::Int(start + size),
                        Arg::Int(1),
                    ],
                    vec![out],
                ));
                start += size;
            }
            Ok(Some(slices))
        })
    }
}

unit_pass!(
    /// `mm` becomes a batched `bmm` between rank-3 views.
    ConvertMmToBmmPass
);

impl GraphPass for ConvertMmToBmmPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::MM], |graph, node| {
            let a = value_arg(Self::NAME, node, 0)?;
            let b = value_arg(Self::NAME, node, 1)?;
            let mut nodes = Vec::new();
            let mut batched = Vec::with_capacity(2);
            for input in [a, b] {
                let mut shape = graph.shape(input).to_vec();
                shape.insert(0, 1);
                let hint = format!("{}_unsqueeze", node.name);
                let (mut created, out) = move_before_dequant(graph, input, |graph, x| {
                    let v = view(graph, &hint, x, shape);
                    let out = v.output();
                    (vec![v], out)
                });
                nodes.append(&mut created);
                batched.push(out);
            }
            let original = node.output();
            let mut out_shape = graph.shape(original).to_vec();
            out_shape.insert(0, 1);
            let dtype = graph.dtype(original);
            let mut bmm = graph.create_node(
                &format!("{}_bmm", node.name),
                aten::BMM,
                vec![Arg::Value(batched[0]), Arg::Value(batched[1])],
                out_shape,
                dtype,
            );
            bmm.meta = node.meta.clone();
            let produced = bmm.output();
            nodes.push(bmm);
            nodes.extend(util::reshape_into(graph, produced, original));
            Ok(Some(nodes))
        })
    }
}

unit_pass!(
    /// `full_like(x, v)` becomes `full(shape(x), v)`.
    ConvertFullLikeToFullPass
);

impl GraphPass for ConvertFullLikeToFullPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::FULL_LIKE], |graph, node| {
            let input = value_arg(Self::NAME, node, 0)?;
            let fill = node.float_arg(1).unwrap_or(0.0);
            let dtype = node.dtype_arg(2).unwrap_or_else(|| graph.dtype(input));
            let shape = to_ints(graph.shape(input));
            Ok(Some(vec![retarget(
                node,
                aten::FULL,
                vec![Arg::Ints(shape), Arg::Float(fill), Arg::DType(dtype)],
            )]))
        })
    }
}

unit_pass!(
    /// `relu` and `hardtanh` become `clamp`.
    ConvertToClampPass
);

impl GraphPass for ConvertToClampPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::RELU, aten::HARDTANH], |_, node| {
            let input = value_arg(Self::NAME, node, 0)?;
            let (lo, hi) = if node.is(aten::RELU) {
                (Arg::Float(0.0), Arg::None)
            } else {
                (
                    Arg::Float(node.float_arg(1).unwrap_or(-1.0)),
                    Arg::Float(node.float_arg(2).unwrap_or(1.0)),
                )
            };
            Ok(Some(vec![retarget(
                node,
                aten::CLAMP,
                vec![Arg::Value(input), lo, hi],
            )]))
        })
    }
}

unit_pass!(
    /// `max.dim`/`min.dim` whose indices are unused become `amax`/`amin`.
    ConvertMinMaxPass
);

impl GraphPass for ConvertMinMaxPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::MAX_DIM, aten::MIN_DIM], |graph, node| {
            if let Some(&indices) = node.outputs.get(1) {
                if !graph.users(indices).is_empty() || graph.is_output(indices) {
                    return Err(LoweringError::legalization(
                        Self::NAME,
                        &node.name,
                        "arg-reduction indices are consumed",
                    ));
                }
            }
            let input = value_arg(Self::NAME, node, 0)?;
            let dim = int_arg(Self::NAME, node, 1)?;
            let keepdim = node.bool_arg(2).unwrap_or(false);
            let target = if node.is(aten::MAX_DIM) {
                aten::AMAX
            } else {
                aten::AMIN
            };
            let mut reduce = retarget(
                node,
                target,
                vec![Arg::Value(input), Arg::Ints(vec![dim]), Arg::Bool(keepdim)],
            );
            reduce.outputs.truncate(1);
            Ok(Some(vec![reduce]))
        })
    }
}

unit_pass!(
    /// `any.default` and `any.dim` become `any.dims` with explicit dimensions.
    ConvertAnyDefaultDimDimsPass
);

impl GraphPass for ConvertAnyDefaultDimDimsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::ANY, aten::ANY_DIM], |graph, node| {
            let input = value_arg(Self::NAME, node, 0)?;
            let (dims, keepdim) = if node.is(aten::ANY) {
                let rank = graph.shape(input).len() as i64;
                ((0..rank).collect(), false)
            } else {
                (
                    vec![int_arg(Self::NAME, node, 1)?],
                    node.bool_arg(2).unwrap_or(false),
                )
            };
            Ok(Some(vec![retarget(
                node,
                aten::ANY_DIMS,
                vec![Arg::Value(input), Arg::Ints(dims), Arg::Bool(keepdim)],
            )]))
        })
    }
}

unit_pass!(
    /// `expand_copy` becomes `repeat` with the equivalent multiples.
    ConvertExpandCopyToRepeatPass
);

impl GraphPass for ConvertExpandCopyToRepeatPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::EXPAND], |graph, node| {
            let input = value_arg(Self::NAME, node, 0)?;
            let sizes = ints_arg(Self::NAME, node, 1)?;
            let shape = graph.shape(input);
            if sizes.len() < shape.len() {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    "expand to a lower rank",
                ));
            }
            let offset = sizes.len() - shape.len();
            let mut multiples = Vec::with_capacity(sizes.len());
            for (i, &size) in sizes.iter().enumerate() {
                let current = if i < offset { 1 } else { shape[i - offset] as i64 };
                let target = if size == -1 { current } else { size };
                let multiple = if current == target {
                    1
                } else if current == 1 {
                    target
                } else {
                    return Err(LoweringError::legalization(
                        Self::NAME,
                        &node.name,
                        format!("cannot expand dimension {i} from {current} to {target}"),
                    ));
                };
                multiples.push(multiple);
            }
            Ok(Some(vec![retarget(
                node,
                aten::REPEAT,
                vec![Arg::Value(input), Arg::Ints(multiples)],
            )]))
        })
    }
}

unit_pass!(
    /// Give `repeat` inputs the rank of their multiples.
    UnsqueezeBeforeRepeatPass
);

impl GraphPass for UnsqueezeBeforeRepeatPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::REPEAT], |graph, node| {
            let input = value_arg(Self::NAME, node, 0)?;
            let multiples = ints_arg(Self::NAME, node, 1)?;
            let shape = graph.shape(input).to_vec();
            if multiples.len() <= shape.len() {
                return Ok(None);
            }
            let mut padded = vec![1; multiples.len() - shape.len()];
            padded.extend_from_slice(&shape);
            let hint = format!("{}_unsqueeze", node.name);
            let (mut nodes, reshaped) = move_before_dequant(graph, input, |graph, x| {
                let v = view(graph, &hint, x, padded);
                let out = v.output();
                (vec![v], out)
            });
            nodes.push(retarget(
                node,
                aten::REPEAT,
                vec![Arg::Value(reshaped), Arg::Ints(multiples)],
            ));
            Ok(Some(nodes))
        })
    }
}

unit_pass!(
    /// `squeeze_copy` and `unsqueeze_copy` become `view_copy`.
    ConvertSqueezesToViewPass
);

impl GraphPass for ConvertSqueezesToViewPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SQUEEZE, aten::UNSQUEEZE], |graph, node| {
            let input = value_arg(Self::NAME, node, 0)?;
            let shape = to_ints(graph.shape(node.output()));
            Ok(Some(vec![retarget(
                node,
                aten::VIEW,
                vec![Arg::Value(input), Arg::Ints(shape)],
            )]))
        })
    }
}

unit_pass!(
    /// `pow(x, n)` with a small positive integer exponent becomes a chain of `mul`.
    ConvertIntPowToMuls
);

impl ConvertIntPowToMuls {
    const MAX_EXPONENT: i64 = 6;
}

impl GraphPass for ConvertIntPowToMuls {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::POW_SCALAR], |graph, node| {
            let input = value_arg(Self::NAME, node, 0)?;
            let exponent = match node.float_arg(1) {
                Some(e) if e.fract() == 0.0 => e as i64,
                _ => return Ok(None),
            };
            if !(2..=Self::MAX_EXPONENT).contains(&exponent) {
                return Ok(None);
            }
            let mut nodes = Vec::new();
            let mut acc = input;
            for _ in 2..exponent {
                let mul = binary(graph, &format!("{}_mul", node.name), aten::MUL, acc, input);
                acc = mul.output();
                nodes.push(mul);
            }
            nodes.push(retarget(
                node,
                aten::MUL,
                vec![Arg::Value(acc), Arg::Value(input)],
            ));
            Ok(Some(nodes))
        })
    }
}

unit_pass!(
    /// Drop `clone` nodes.
    RemoveClonePass
);

impl GraphPass for RemoveClonePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            if !graph.nodes[i].is(aten::CLONE) {
                i += 1;
                continue;
            }
            let node = graph.remove_node(i);
            let input = value_arg(Self::NAME, &node, 0)?;
            graph.replace_uses_from(i, node.output(), input);
            changed = true;
        }
        Ok(changed)
    }
}

unit_pass!(
    /// Collapse `view(view(x))` when the inner view has no other user.
    FuseViewCopyTransform
);

impl GraphPass for FuseViewCopyTransform {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for i in 0..graph.nodes.len() {
            if !graph.nodes[i].is(aten::VIEW) {
                continue;
            }
            let Some(inner_out) = graph.nodes[i].value_arg(0) else {
                continue;
            };
            let Some(inner) = graph.producer_node(inner_out) else {
                continue;
            };
            if !inner.is(aten::VIEW) || inner.meta.is_quantized() {
                continue;
            }
            let Some(source) = inner.value_arg(0) else {
                continue;
            };
            if graph.users(inner_out).len() != 1 || graph.is_output(inner_out) {
                continue;
            }
            graph.nodes[i].replace_input(inner_out, source);
            changed = true;
        }
        Ok(changed)
    }
}

unit_pass!(
    /// Scalar operands of binary operators become `full` tensors of the
    /// operand rank, and `.Scalar` overloads become `.Tensor` overloads.
    ReplaceScalarWithTensorArgPass
);

impl ReplaceScalarWithTensorArgPass {
    fn tensor_overload(target: &str) -> Option<&'static str> {
        Some(match target {
            aten::ADD_SCALAR => aten::ADD,
            aten::SUB_SCALAR => aten::SUB,
            aten::MUL_SCALAR => aten::MUL,
            aten::DIV_SCALAR => aten::DIV,
            aten::EQ_SCALAR => aten::EQ,
            aten::NE_SCALAR => aten::NE,
            aten::GT_SCALAR => aten::GT,
            aten::GE_SCALAR => aten::GE,
            aten::LT_SCALAR => aten::LT,
            aten::LE_SCALAR => aten::LE,
            t if util::BINARY_ELEMENTWISE.contains(&t) => return util::BINARY_ELEMENTWISE
                .iter()
                .copied()
                .find(|&known| known == t),
            _ => return None,
        })
    }
}

impl GraphPass for ReplaceScalarWithTensorArgPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let mut targets: Vec<&str> = vec![
            aten::ADD_SCALAR,
            aten::SUB_SCALAR,
            aten::MUL_SCALAR,
            aten::DIV_SCALAR,
            aten::EQ_SCALAR,
            aten::NE_SCALAR,
            aten::GT_SCALAR,
            aten::GE_SCALAR,
            aten::LT_SCALAR,
            aten::LE_SCALAR,
        ];
        targets.extend_from_slice(util::BINARY_ELEMENTWISE);
        rewrite_each(graph, &targets, |graph, node| {
            let Some(target) = Self::tensor_overload(&node.target) else {
                return Ok(None);
            };
            let scalar_slot = match (node.arg(0), node.arg(1)) {
                (Some(Arg::Value(_)), Some(a)) if a.is_scalar() => 1,
                (Some(a), Some(Arg::Value(_))) if a.is_scalar() => 0,
                _ if target != node.target => {
                    return Err(LoweringError::legalization(
                        Self::NAME,
                        &node.name,
                        "scalar overload without a tensor operand",
                    ))
                }
                _ => return Ok(None),
            };
            let tensor = value_arg(Self::NAME, node, 1 - scalar_slot)?;
            let value = node.float_arg(scalar_slot).unwrap_or(0.0);
            let tensor_dtype = graph.dtype(tensor);
            let dtype = if tensor_dtype.is_int() && value.fract() != 0.0 {
                DType::Float32
            } else {
                tensor_dtype
            };
            let rank = graph.shape(tensor).len();
            let full = full_scalar(graph, &format!("{}_scalar", node.name), rank, value, dtype);
            let mut args = node.args.clone();
            args[scalar_slot] = Arg::Value(full.output());
            args.truncate(2);
            Ok(Some(vec![full, retarget(node, target, args)]))
        })
    }
}
