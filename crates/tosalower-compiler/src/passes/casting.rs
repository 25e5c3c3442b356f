//! Type legalization: operand promotion and the integer widths TOSA accepts.

use tosalower_ir::ops::aten;
use tosalower_ir::program::lookup;
use tosalower_ir::{Arg, DType, Graph, Node, StateDict, ValueId};

use super::util::rewrite_each;
use super::{GraphPass, ProgramPass};
use crate::error::{LoweringError, Result};

/// `_to_copy(input, dtype)`.
fn cast(graph: &mut Graph, hint: &str, input: ValueId, dtype: DType) -> Node {
    let shape = graph.shape(input).to_vec();
    graph.create_node(
        hint,
        aten::TO_COPY,
        vec![Arg::Value(input), Arg::DType(dtype)],
        shape,
        dtype,
    )
}

/// Cast the tensor operands at `slots` of `node` to `dtype`. Returns the
/// casts and the rewired copy of `node`.
fn cast_operands(graph: &mut Graph, node: &Node, slots: &[usize], dtype: DType) -> Vec<Node> {
    let mut rewired = node.clone();
    let mut nodes = Vec::new();
    for &slot in slots {
        let Some(value) = node.value_arg(slot) else {
            continue;
        };
        if graph.dtype(value) == dtype {
            continue;
        }
        let hint = format!("{}_cast_{slot}", node.name);
        let c = cast(graph, &hint, value, dtype);
        rewired.args[slot] = Arg::Value(c.output());
        nodes.push(c);
    }
    nodes.push(rewired);
    nodes
}

/// Run `node` in `dtype` and cast the result back to its declared type.
fn compute_in(graph: &mut Graph, node: &Node, slots: &[usize], dtype: DType) -> Vec<Node> {
    let out = node.output();
    let declared = graph.dtype(out);
    let mut nodes = cast_operands(graph, node, slots, dtype);
    let Some(mut computed) = nodes.pop() else {
        return nodes;
    };
    let shape = graph.shape(out).to_vec();
    let wide = graph.add_intermediate(&format!("{}_{dtype}", node.name), shape, dtype);
    computed.name = graph.value(wide).name.clone();
    computed.outputs = vec![wide];
    nodes.push(computed);
    let mut back = Node::new(
        node.name.clone(),
        aten::TO_COPY,
        vec![Arg::Value(wide), Arg::DType(declared)],
        node.outputs.clone(),
    );
    back.meta = node.meta.clone();
    nodes.push(back);
    nodes
}

const PROMOTED: &[&str] = &[
    aten::ADD,
    aten::SUB,
    aten::MUL,
    aten::DIV,
    aten::MAXIMUM,
    aten::MINIMUM,
    aten::EQ,
    aten::NE,
    aten::GT,
    aten::GE,
    aten::LT,
    aten::LE,
    aten::WHERE,
];

unit_pass!(
    /// Casts the operands of arithmetic, comparison and `where` to their
    /// promoted type when they disagree.
    MatchArgDtypePass
);

impl GraphPass for MatchArgDtypePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, PROMOTED, |graph, node| {
            if node.meta.is_quantized() {
                return Ok(None);
            }
            let slots: &[usize] = if node.is(aten::WHERE) { &[1, 2] } else { &[0, 1] };
            let (Some(a), Some(b)) = (node.value_arg(slots[0]), node.value_arg(slots[1])) else {
                return Ok(None);
            };
            let (da, db) = (graph.dtype(a), graph.dtype(b));
            if da == db {
                return Ok(None);
            }
            Ok(Some(cast_operands(graph, node, slots, da.promote(db))))
        })
    }

    fn inserts_casts(&self) -> bool {
        true
    }
}

unit_pass!(
    /// Shifts on narrow integers run in int32 on restricted targets.
    CastToInt32Pass
);

impl GraphPass for CastToInt32Pass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::LSHIFT, aten::RSHIFT], |graph, node| {
            let narrow = node
                .inputs()
                .any(|v| matches!(graph.dtype(v), DType::Int8 | DType::Int16));
            if !narrow {
                return Ok(None);
            }
            Ok(Some(compute_in(graph, node, &[0, 1], DType::Int32)))
        })
    }

    fn inserts_casts(&self) -> bool {
        true
    }
}

unit_pass!(
    /// Bitwise operators on `bool` run on int8 and cast back.
    CastBoolToInt8Pass
);

impl GraphPass for CastBoolToInt8Pass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let targets = [aten::BITWISE_AND, aten::BITWISE_OR, aten::BITWISE_XOR];
        rewrite_each(graph, &targets, |graph, node| {
            if !node.inputs().all(|v| graph.dtype(v) == DType::Bool) {
                return Ok(None);
            }
            Ok(Some(compute_in(graph, node, &[0, 1], DType::Int8)))
        })
    }

    fn inserts_casts(&self) -> bool {
        true
    }
}

unit_pass!(
    /// Static int64 data is narrowed to int32; values that do not fit are an
    /// error.
    CastInt64BuffersToInt32Pass
);

impl ProgramPass for CastInt64BuffersToInt32Pass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        for id in graph.used_static_values() {
            if graph.dtype(id) != DType::Int64 {
                continue;
            }
            let Some(data) = lookup(graph, state, id) else {
                continue;
            };
            let name = graph.value(id).name.clone();
            if !data.fits_in(DType::Int32) {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &name,
                    "int64 data does not fit in int32",
                ));
            }
            let narrowed = data.cast(DType::Int32);
            state.insert(name, narrowed);
            graph.value_mut(id).dtype = DType::Int32;
            changed = true;
        }
        Ok(changed)
    }
}

unit_pass!(
    /// Marks float-to-integer `_to_copy` nodes, which TOSA `CAST` would
    /// round, so they lower as truncation toward zero.
    DecorateFp32toInt32CastingPass
);

impl GraphPass for DecorateFp32toInt32CastingPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for i in 0..graph.nodes.len() {
            let node = &graph.nodes[i];
            if !node.is(aten::TO_COPY) || node.meta.truncating_cast {
                continue;
            }
            let (Some(input), Some(dtype)) = (node.value_arg(0), node.dtype_arg(1)) else {
                continue;
            };
            if graph.dtype(input).is_float() && dtype.is_int() {
                graph.nodes[i].meta.truncating_cast = true;
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tosalower_ir::{TensorData, ValueKind};

    fn binary_graph(target: &str, a: DType, b: DType, out: DType) -> Graph {
        let mut g = Graph::new();
        let x = g.add_input("a", vec![4], a);
        let y = g.add_input("b", vec![4], b);
        let node = g.create_node("op", target, vec![Arg::Value(x), Arg::Value(y)], vec![4], out);
        let o = node.output();
        g.push_node(node);
        g.add_output(o);
        g
    }

    #[test]
    fn test_match_arg_dtype_promotes() {
        let mut g = binary_graph(aten::ADD, DType::Int32, DType::Float32, DType::Float32);
        assert!(MatchArgDtypePass.call(&mut g).unwrap());
        g.validate().unwrap();
        assert!(g.nodes[0].is(aten::TO_COPY));
        assert_eq!(g.dtype(g.nodes[0].output()), DType::Float32);
        assert_eq!(g.nodes[1].value_arg(0), Some(g.nodes[0].output()));
        assert!(!MatchArgDtypePass.call(&mut g).unwrap());
    }

    #[test]
    fn test_shift_runs_in_int32() {
        let mut g = binary_graph(aten::RSHIFT, DType::Int8, DType::Int8, DType::Int8);
        let out = g.outputs[0];
        assert!(CastToInt32Pass.call(&mut g).unwrap());
        g.validate().unwrap();
        let targets: Vec<&str> = g.nodes.iter().map(|n| n.target.as_str()).collect();
        assert_eq!(
            targets,
            vec![aten::TO_COPY, aten::TO_COPY, aten::RSHIFT, aten::TO_COPY]
        );
        assert_eq!(g.dtype(g.nodes[2].output()), DType::Int32);
        assert_eq!(g.nodes[3].outputs, vec![out]);
        assert_eq!(g.dtype(out), DType::Int8);
    }

    #[test]
    fn test_bool_bitwise_runs_in_int8() {
        let mut g = binary_graph(aten::BITWISE_AND, DType::Bool, DType::Bool, DType::Bool);
        assert!(CastBoolToInt8Pass.call(&mut g).unwrap());
        g.validate().unwrap();
        assert_eq!(g.dtype(g.nodes[2].output()), DType::Int8);

        let mut ints = binary_graph(aten::BITWISE_AND, DType::Int8, DType::Int8, DType::Int8);
        assert!(!CastBoolToInt8Pass.call(&mut ints).unwrap());
    }

    #[test]
    fn test_int64_buffers_narrowed() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![2], DType::Int32);
        let b = g.add_placeholder("b", vec![2], DType::Int64, ValueKind::Buffer);
        let node = g.create_node(
            "add",
            aten::ADD,
            vec![Arg::Value(x), Arg::Value(b)],
            vec![2],
            DType::Int32,
        );
        let out = node.output();
        g.push_node(node);
        g.add_output(out);
        let mut state = StateDict::new();
        let data = TensorData::from_i64(DType::Int64, vec![2], vec![7, -3]).unwrap();
        state.insert("b".into(), data);

        assert!(CastInt64BuffersToInt32Pass.call(&mut g, &mut state).unwrap());
        assert_eq!(g.dtype(b), DType::Int32);
        assert_eq!(state["b"].dtype, DType::Int32);

        state.insert(
            "b".into(),
            TensorData::from_i64(DType::Int64, vec![2], vec![1 << 40, 0]).unwrap(),
        );
        g.value_mut(b).dtype = DType::Int64;
        assert!(matches!(
            CastInt64BuffersToInt32Pass.call(&mut g, &mut state),
            Err(LoweringError::Legalization { .. })
        ));
    }

    #[test]
    fn test_float_to_int_cast_is_decorated() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![3], DType::Float32);
        let node = g.create_node(
            "cast",
            aten::TO_COPY,
            vec![Arg::Value(x), Arg::DType(DType::Int32)],
            vec![3],
            DType::Int32,
        );
        g.push_node(node);
        assert!(DecorateFp32toInt32CastingPass.call(&mut g).unwrap());
        assert!(g.nodes[0].meta.truncating_cast);
        assert!(!DecorateFp32toInt32CastingPass.call(&mut g).unwrap());
    }
}
