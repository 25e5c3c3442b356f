//! Reductions and normalizations.

use tosalower_ir::ops::aten;
use tosalower_ir::{Arg, Graph, Node, NumericProfile, ValueId};

use super::super::util::{
    dims_or_all, ints_arg, move_before_dequant, normalize_dims, reduced_shape, reshape_into,
    rewrite_each, to_ints, value_arg, view, Decomposition,
};
use super::super::{GraphPass};
use crate::context::LoweringContext;
use crate::error::{LoweringError, Result};

unit_pass!(
    /// `mean.dim` as average pooling on integer targets and as
    /// `sum * (1 / n)` on floating-point targets.
    ///
    /// Reads the active target from the lowering context.
    DecomposeMeanDimPass
);

impl DecomposeMeanDimPass {
    fn as_sum(graph: &mut Graph, node: &Node, x: ValueId, dims: &[usize]) -> Option<Vec<Node>> {
        let count: usize = dims.iter().map(|&d| graph.shape(x)[d]).product();
        let mut d = Decomposition::new(graph, node);
        let total = d.sum(x, dims);
        let scale = d.constant(x, 1.0 / count.max(1) as f64);
        let mean = d.binary(aten::MUL, total, scale);
        d.view_as_output(mean, node);
        d.finish(node)
    }

    fn as_avg_pool(graph: &mut Graph, node: &Node, x: ValueId, dims: &[usize]) -> Vec<Node> {
        let shape = graph.shape(x).to_vec();
        let rank = shape.len();
        let original = node.output();
        let dtype = graph.dtype(original);
        let pool_args = |input: ValueId, kernel: [i64; 2]| {
            vec![
                Arg::Value(input),
                Arg::Ints(kernel.to_vec()),
                Arg::Ints(kernel.to_vec()),
                Arg::Ints(vec![0, 0]),
                Arg::Bool(false),
                Arg::Bool(true),
                Arg::None,
            ]
        };

        if rank == 4 && dims == [2, 3] {
            let kernel = [shape[2] as i64, shape[3] as i64];
            let out_shape = vec![shape[0], shape[1], 1, 1];
            if graph.shape(original) == out_shape.as_slice() {
                let mut pool = Node::new(
                    node.name.clone(),
                    aten::AVG_POOL2D,
                    pool_args(x, kernel),
                    node.outputs.clone(),
                );
                pool.meta = node.meta.clone();
                return vec![pool];
            }
            let mut pool = graph.create_node(
                &format!("{}_pool", node.name),
                aten::AVG_POOL2D,
                pool_args(x, kernel),
                out_shape,
                dtype,
            );
            pool.meta = node.meta.clone();
            let produced = pool.output();
            let mut nodes = vec![pool];
            nodes.extend(reshape_into(graph, produced, original));
            return nodes;
        }

        // Move the reduced dimensions last and pool over a [1, 1, outer, inner] view.
        let kept: Vec<usize> = (0..rank).filter(|i| !dims.contains(i)).collect();
        let outer: usize = kept.iter().map(|&i| shape[i]).product();
        let inner: usize = dims.iter().map(|&i| shape[i]).product();
        let mut perm = kept.clone();
        perm.extend_from_slice(dims);
        let needs_permute = perm.iter().enumerate().any(|(i, &p)| i != p);
        let hint = node.name.clone();
        let (mut nodes, pooled_input) = move_before_dequant(graph, x, |graph, input| {
            let mut created = Vec::new();
            let mut current = input;
            if needs_permute {
                let permuted_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
                let permute = graph.create_node(
                    &format!("{hint}_permute"),
                    aten::PERMUTE,
                    vec![Arg::Value(current), Arg::Ints(to_ints(&perm))],
                    permuted_shape,
                    graph.dtype(current),
                );
                current = permute.output();
                created.push(permute);
            }
            let reshaped = view(graph, &format!("{hint}_view"), current, vec![1, 1, outer, inner]);
            current = reshaped.output();
            created.push(reshaped);
            (created, current)
        });
        let mut pool = graph.create_node(
            &format!("{}_pool", node.name),
            aten::AVG_POOL2D,
            pool_args(pooled_input, [1, inner as i64]),
            vec![1, 1, outer, 1],
            dtype,
        );
        pool.meta = node.meta.clone();
        let produced = pool.output();
        nodes.push(pool);
        nodes.extend(reshape_into(graph, produced, original));
        nodes
    }
}

impl GraphPass for DecomposeMeanDimPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let spec = LoweringContext::require()?;
        let integer = spec.numeric_profile() == NumericProfile::IntegerQuantized;
        rewrite_each(graph, &[aten::MEAN_DIM], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let rank = graph.shape(x).len();
            let dims = dims_or_all(Self::NAME, node, 1, rank)?;
            if integer {
                Ok(Some(Self::as_avg_pool(graph, node, x, &dims)))
            } else {
                Ok(Self::as_sum(graph, node, x, &dims))
            }
        })
    }
}

/// `mean.dim(x, dims, keepdim=true)` as a new node.
fn mean_keepdim(d: &mut Decomposition<'_>, x: ValueId, dims: &[usize]) -> ValueId {
    let shape = reduced_shape(d.graph.shape(x), dims, true);
    let dtype = d.graph.dtype(x);
    d.node(
        aten::MEAN_DIM,
        vec![
            Arg::Value(x),
            Arg::Ints(dims.iter().map(|&i| i as i64).collect()),
            Arg::Bool(true),
        ],
        shape,
        dtype,
    )
}

unit_pass!(
    /// `var(x) = sum((x - mean(x))^2) / (n - correction)`.
    DecomposeVarPass
);

impl GraphPass for DecomposeVarPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::VAR], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let shape = graph.shape(x).to_vec();
            let dims = dims_or_all(Self::NAME, node, 1, shape.len())?;
            let correction = node.int_arg(2).unwrap_or(1);
            let count = dims.iter().map(|&i| shape[i] as i64).product::<i64>();
            let divisor = (count - correction).max(1) as f64;

            let mut d = Decomposition::new(graph, node);
            let mean = mean_keepdim(&mut d, x, &dims);
            let centered = d.binary(aten::SUB, x, mean);
            let squared = d.binary(aten::MUL, centered, centered);
            let total = d.sum(squared, &dims);
            let scale = d.constant(x, 1.0 / divisor);
            let var = d.binary(aten::MUL, total, scale);
            d.view_as_output(var, node);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// `layer_norm` over the trailing `normalized_shape` dimensions.
    DecomposeLayerNormPass
);

impl GraphPass for DecomposeLayerNormPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::LAYER_NORM], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let normalized = ints_arg(Self::NAME, node, 1)?;
            let shape = graph.shape(x).to_vec();
            if normalized.len() > shape.len() {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    "normalized shape has a higher rank than the input",
                ));
            }
            let dims: Vec<usize> = (shape.len() - normalized.len()..shape.len()).collect();
            let weight = node.value_arg(2);
            let bias = node.value_arg(3);
            let eps = node.float_arg(4).unwrap_or(1e-5);

            let mut d = Decomposition::new(graph, node);
            let mean = mean_keepdim(&mut d, x, &dims);
            let centered = d.binary(aten::SUB, x, mean);
            let squared = d.binary(aten::MUL, centered, centered);
            let var = mean_keepdim(&mut d, squared, &dims);
            let epsilon = d.constant(x, eps);
            let shifted = d.binary(aten::ADD, var, epsilon);
            let rstd = d.unary(aten::RSQRT, shifted);
            let mut out = d.binary(aten::MUL, centered, rstd);
            if let Some(w) = weight {
                out = d.binary(aten::MUL, out, w);
            }
            if let Some(b) = bias {
                d.binary(aten::ADD, out, b);
            }
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// `linalg_vector_norm` for `ord` 1 and 2.
    DecomposeLinearVectorNormPass
);

impl GraphPass for DecomposeLinearVectorNormPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::LINALG_VECTOR_NORM], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let ord = node.float_arg(1).unwrap_or(2.0);
            let rank = graph.shape(x).len();
            let dims = dims_or_all(Self::NAME, node, 2, rank)?;

            let mut d = Decomposition::new(graph, node);
            let norm = if ord == 1.0 {
                let magnitude = d.unary(aten::ABS, x);
                d.sum(magnitude, &dims)
            } else if ord == 2.0 {
                let squared = d.binary(aten::MUL, x, x);
                let total = d.sum(squared, &dims);
                d.unary(aten::SQRT, total)
            } else {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    format!("unsupported norm order {ord}"),
                ));
            };
            d.view_as_output(norm, node);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// Multi-dimension `sum` becomes a chain of single-dimension sums that
    /// keep their reduced dimension, followed by a view.
    DecomposeSumPass
);

impl GraphPass for DecomposeSumPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SUM], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let rank = graph.shape(x).len();
            let dims = match node.arg(1) {
                Some(Arg::Ints(dims)) if !dims.is_empty() => {
                    normalize_dims(Self::NAME, node, dims, rank)?
                }
                _ => (0..rank).collect(),
            };
            let keepdim = node.bool_arg(2).unwrap_or(false);
            if dims.is_empty() || (dims.len() == 1 && keepdim) {
                return Ok(None);
            }

            let output_params = node.output_qparams(0).cloned();
            let mut d = Decomposition::new(graph, node);
            let mut current = x;
            let mut last_link_meta = Default::default();
            for (step, &dim) in dims.iter().enumerate() {
                let shape = reduced_shape(d.graph.shape(current), &[dim], true);
                let dtype = d.graph.dtype(node.output());
                let hint = format!("{}_sum", node.name);
                let mut link = d.graph.create_node(
                    &hint,
                    aten::SUM,
                    vec![Arg::Value(current), Arg::Ints(vec![dim as i64]), Arg::Bool(true)],
                    shape,
                    dtype,
                );
                // Each link reads what the previous link wrote.
                if step == 0 {
                    if let Some(p) = node.input_qparams(0) {
                        link.meta.input_qparams.insert(0, p.clone());
                    }
                } else if let Some(p) = &output_params {
                    link.meta.input_qparams.insert(0, p.clone());
                }
                if let Some(p) = &output_params {
                    link.meta.output_qparams.insert(0, p.clone());
                }
                last_link_meta = link.meta.clone();
                current = d.push(link);
            }
            let target = d.graph.shape(node.output()).to_vec();
            let reshaped = d.graph.shape(current) != target.as_slice();
            if reshaped {
                d.view(current, target);
            }
            let mut nodes = d.finish(node).unwrap_or_default();
            // The links carry their own parameters; the trailing view carries none.
            let count = nodes.len();
            if reshaped {
                nodes[count - 1].meta = Default::default();
            } else if count > 0 {
                nodes[count - 1].meta = last_link_meta;
            }
            Ok(Some(nodes))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tosalower_ir::{DType, TosaSpecification};

    fn reduce_graph(target: &str, shape: &[usize], args: Vec<Arg>, out: &[usize]) -> Graph {
        let mut g = Graph::new();
        let x = g.add_input("x", shape.to_vec(), DType::Float32);
        let mut all = vec![Arg::Value(x)];
        all.extend(args);
        let node = g.create_node("reduce", target, all, out.to_vec(), DType::Float32);
        let y = node.output();
        g.push_node(node);
        g.add_output(y);
        g
    }

    fn with_spec<T>(spec: &str, f: impl FnOnce() -> T) -> T {
        let spec: TosaSpecification = spec.parse().unwrap();
        let _guard = LoweringContext::enter(spec);
        f()
    }

    #[test]
    fn test_spatial_mean_is_avg_pool_on_integer_targets() {
        let mut g = reduce_graph(
            aten::MEAN_DIM,
            &[1, 8, 4, 4],
            vec![Arg::Ints(vec![-1, -2]), Arg::Bool(true)],
            &[1, 8, 1, 1],
        );
        with_spec("TOSA-1.0+INT", || DecomposeMeanDimPass.call(&mut g)).unwrap();
        assert_eq!(g.nodes.len(), 1);
        assert!(g.nodes[0].is(aten::AVG_POOL2D));
        assert_eq!(g.nodes[0].ints_arg(1), Some(&[4, 4][..]));
    }

    #[test]
    fn test_mean_is_sum_and_mul_on_float_targets() {
        let mut g = reduce_graph(
            aten::MEAN_DIM,
            &[2, 6],
            vec![Arg::Ints(vec![1]), Arg::Bool(false)],
            &[2],
        );
        with_spec("TOSA-0.80+MI", || DecomposeMeanDimPass.call(&mut g)).unwrap();
        g.validate().unwrap();
        let targets: Vec<&str> = g.nodes.iter().map(|n| n.target.as_str()).collect();
        assert_eq!(targets, vec![aten::SUM, aten::FULL, aten::MUL, aten::VIEW]);
    }

    #[test]
    fn test_non_spatial_mean_on_integer_targets() {
        let mut g = reduce_graph(
            aten::MEAN_DIM,
            &[2, 3, 5],
            vec![Arg::Ints(vec![1]), Arg::Bool(false)],
            &[2, 5],
        );
        with_spec("TOSA-0.80+BI", || DecomposeMeanDimPass.call(&mut g)).unwrap();
        g.validate().unwrap();
        let pool = g.nodes.iter().find(|n| n.is(aten::AVG_POOL2D)).unwrap();
        assert_eq!(pool.ints_arg(1), Some(&[1, 3][..]));
        assert!(g.nodes.iter().any(|n| n.is(aten::PERMUTE)));
    }

    #[test]
    fn test_mean_requires_context() {
        let mut g = reduce_graph(aten::MEAN_DIM, &[2, 6], vec![Arg::Ints(vec![1])], &[2]);
        assert!(matches!(
            DecomposeMeanDimPass.call(&mut g),
            Err(LoweringError::NoActiveSpecification)
        ));
    }

    #[test]
    fn test_var_emits_mean_dim() {
        let mut g = reduce_graph(
            aten::VAR,
            &[4, 10],
            vec![Arg::Ints(vec![1]), Arg::Int(1), Arg::Bool(true)],
            &[4, 1],
        );
        assert!(DecomposeVarPass.call(&mut g).unwrap());
        g.validate().unwrap();
        assert!(g.nodes[0].is(aten::MEAN_DIM));
        let scale = g.nodes.iter().find(|n| n.is(aten::FULL)).unwrap();
        approx::assert_relative_eq!(scale.float_arg(1).unwrap(), 1.0 / 9.0);
    }

    #[test]
    fn test_layer_norm_uses_trailing_dims() {
        let mut g = reduce_graph(
            aten::LAYER_NORM,
            &[2, 3, 8],
            vec![Arg::Ints(vec![8]), Arg::None, Arg::None, Arg::Float(1e-5)],
            &[2, 3, 8],
        );
        assert!(DecomposeLayerNormPass.call(&mut g).unwrap());
        g.validate().unwrap();
        assert_eq!(g.nodes[0].ints_arg(1), Some(&[2][..]));
        assert!(g.nodes.last().unwrap().is(aten::MUL));
    }

    #[test]
    fn test_sum_chain() {
        let mut g = reduce_graph(
            aten::SUM,
            &[2, 3, 4],
            vec![Arg::Ints(vec![0, 2]), Arg::Bool(false)],
            &[3],
        );
        assert!(DecomposeSumPass.call(&mut g).unwrap());
        g.validate().unwrap();
        let targets: Vec<&str> = g.nodes.iter().map(|n| n.target.as_str()).collect();
        assert_eq!(targets, vec![aten::SUM, aten::SUM, aten::VIEW]);
        assert!(!DecomposeSumPass.call(&mut g).unwrap());
    }
}
