//! Structural validation of a [`Graph`].
//!
//! Checks run in this order and stop at the first failure:
//! every referenced id is in bounds, each value has at most one producer,
//! intermediates are produced before they are consumed, and every graph
//! output is either a placeholder or produced by a node.

use std::collections::HashSet;

use super::{Graph, ValueId};
use crate::error::IrError;

pub fn validate_graph(graph: &Graph) -> Result<(), IrError> {
    let count = graph.values.len();
    let in_bounds = |id: ValueId| {
        if id.0 < count {
            Ok(())
        } else {
            Err(IrError::ValueOutOfBounds { index: id.0, count })
        }
    };

    for &id in graph.inputs.iter().chain(&graph.outputs) {
        in_bounds(id)?;
    }
    for node in &graph.nodes {
        for id in node.inputs().chain(node.outputs.iter().copied()) {
            in_bounds(id)?;
        }
    }

    let mut defined: HashSet<ValueId> = graph
        .values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.kind.is_placeholder())
        .map(|(i, _)| ValueId(i))
        .collect();
    let mut produced = HashSet::new();

    for node in &graph.nodes {
        for input in node.inputs() {
            if !defined.contains(&input) {
                return Err(IrError::UseBeforeDefinition {
                    node: node.name.clone(),
                    value: graph.value(input).name.clone(),
                });
            }
        }
        for &out in &node.outputs {
            if !produced.insert(out) || graph.value(out).kind.is_placeholder() {
                return Err(IrError::DuplicateProducer {
                    value: graph.value(out).name.clone(),
                });
            }
            defined.insert(out);
        }
    }

    for &out in &graph.outputs {
        if !defined.contains(&out) {
            return Err(IrError::OutputWithoutProducer {
                value: graph.value(out).name.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::graph::{Arg, Node, Value, ValueKind};
    use crate::ops::aten;

    #[test]
    fn test_valid_graph() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![2], DType::Float32);
        let n = g.create_node("abs", aten::ABS, vec![Arg::Value(x)], vec![2], DType::Float32);
        let y = n.output();
        g.push_node(n);
        g.add_output(y);
        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_use_before_definition() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![2], DType::Float32);
        let a = g.create_node("a", aten::ABS, vec![Arg::Value(x)], vec![2], DType::Float32);
        let a_out = a.output();
        let b = g.create_node("b", aten::NEG, vec![Arg::Value(a_out)], vec![2], DType::Float32);
        let out = b.output();
        g.push_node(b);
        g.push_node(a);
        g.add_output(out);
        assert!(matches!(
            validate_graph(&g),
            Err(IrError::UseBeforeDefinition { .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_and_unproduced_output() {
        let mut g = Graph::new();
        g.outputs.push(ValueId(3));
        assert!(matches!(
            validate_graph(&g),
            Err(IrError::ValueOutOfBounds { index: 3, .. })
        ));

        let mut g = Graph::new();
        let v = g.add_value(Value::new("orphan", vec![1], DType::Int8, ValueKind::Intermediate));
        g.add_output(v);
        assert!(matches!(
            validate_graph(&g),
            Err(IrError::OutputWithoutProducer { .. })
        ));
    }

    #[test]
    fn test_duplicate_producer() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![2], DType::Float32);
        let n = g.create_node("a", aten::ABS, vec![Arg::Value(x)], vec![2], DType::Float32);
        let out = n.output();
        g.push_node(n);
        g.push_node(Node::new("b", aten::NEG, vec![Arg::Value(x)], vec![out]));
        assert!(matches!(
            validate_graph(&g),
            Err(IrError::DuplicateProducer { .. })
        ));
    }
}
