//! Arithmetic, comparison and indexing decompositions.

use tosalower_ir::ops::aten;
use tosalower_ir::{Arg, Graph};

use super::super::util::{
    int_arg, normalize_dim, reduced_shape, rewrite_each, value_arg, Decomposition,
};
use super::super::{GraphPass};
use crate::error::{LoweringError, Result};

unit_pass!(
    /// `a / b = a * reciprocal(b)`.
    DecomposeDivPass
);

impl GraphPass for DecomposeDivPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::DIV], |graph, node| {
            let a = value_arg(Self::NAME, node, 0)?;
            let b = value_arg(Self::NAME, node, 1)?;
            let mut d = Decomposition::new(graph, node);
            let inverse = d.unary(aten::RECIPROCAL, b);
            d.binary(aten::MUL, a, inverse);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// `a != b = !(a == b)`.
    DecomposeNotEqualPass
);

impl GraphPass for DecomposeNotEqualPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::NE], |graph, node| {
            let a = value_arg(Self::NAME, node, 0)?;
            let b = value_arg(Self::NAME, node, 1)?;
            let mut d = Decomposition::new(graph, node);
            let equal = d.binary(aten::EQ, a, b);
            d.unary(aten::LOGICAL_NOT, equal);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// `select(x, dim, i)` becomes a unit `slice` and a view dropping `dim`.
    DecomposeSelectPass
);

impl GraphPass for DecomposeSelectPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SELECT], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let shape = graph.shape(x).to_vec();
            let dim = normalize_dim(Self::NAME, node, int_arg(Self::NAME, node, 1)?, shape.len())?;
            let size = shape[dim] as i64;
            let raw = int_arg(Self::NAME, node, 2)?;
            let index = if raw < 0 { raw + size } else { raw };
            if !(0..size).contains(&index) {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    format!("index {raw} out of range for dimension of size {size}"),
                ));
            }
            let dtype = graph.dtype(x);
            let mut d = Decomposition::new(graph, node);
            let slice = d.node(
                aten::SLICE,
                vec![
                    Arg::Value(x),
                    Arg::Int(dim as i64),
                    Arg::Int(index),
                    Arg::Int(index + 1),
                    Arg::Int(1),
                ],
                reduced_shape(&shape, &[dim], true),
                dtype,
            );
            d.view_as_output(slice, node);
            Ok(d.finish(node))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tosalower_ir::DType;

    #[test]
    fn test_select_negative_index() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![3, 4], DType::Float32);
        let node = g.create_node(
            "select",
            aten::SELECT,
            vec![Arg::Value(x), Arg::Int(0), Arg::Int(-1)],
            vec![4],
            DType::Float32,
        );
        let out = node.output();
        g.push_node(node);
        g.add_output(out);

        assert!(DecomposeSelectPass.call(&mut g).unwrap());
        g.validate().unwrap();
        assert!(g.nodes[0].is(aten::SLICE));
        assert_eq!(g.nodes[0].int_arg(2), Some(2));
        assert_eq!(g.nodes[0].int_arg(3), Some(3));
        assert!(g.nodes[1].is(aten::VIEW));
        assert_eq!(g.nodes[1].outputs, vec![out]);
    }

    #[test]
    fn test_not_equal() {
        let mut g = Graph::new();
        let a = g.add_input("a", vec![4], DType::Int32);
        let b = g.add_input("b", vec![4], DType::Int32);
        let node = g.create_node(
            "ne",
            aten::NE,
            vec![Arg::Value(a), Arg::Value(b)],
            vec![4],
            DType::Bool,
        );
        let out = node.output();
        g.push_node(node);
        g.add_output(out);

        assert!(DecomposeNotEqualPass.call(&mut g).unwrap());
        assert!(g.nodes[0].is(aten::EQ));
        assert_eq!(g.dtype(g.nodes[0].output()), DType::Bool);
        assert!(g.nodes[1].is(aten::LOGICAL_NOT));
    }
}
