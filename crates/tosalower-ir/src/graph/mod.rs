//! Captured operator graphs.
//!
//! A [`Graph`] owns an arena of [`Value`]s addressed by [`ValueId`] and a list
//! of [`Node`]s kept in topological order. Placeholder values (inputs,
//! parameters, buffers, lifted constants) have no producer; every other value
//! is written by exactly one node.

mod node;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub use node::{Arg, Node, NodeMeta};
pub use validation::validate_graph;

use crate::dtype::DType;
use crate::error::IrError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Runtime graph input.
    Input,
    /// Trained weight, data lives in the state dict.
    Parameter,
    /// Non-trainable state, data lives in the state dict.
    Buffer,
    /// Constant lifted out of the graph, data lives in the state dict.
    Constant,
    /// Produced by a node.
    Intermediate,
}

impl ValueKind {
    /// Parameters, buffers and constants: values whose data is known ahead of time.
    pub fn is_static(self) -> bool {
        matches!(
            self,
            ValueKind::Parameter | ValueKind::Buffer | ValueKind::Constant
        )
    }

    pub fn is_placeholder(self) -> bool {
        self != ValueKind::Intermediate
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub kind: ValueKind,
    /// Memory layout annotation; `None` means contiguous row-major.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim_order: Option<Vec<usize>>,
}

impl Value {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType, kind: ValueKind) -> Self {
        Value {
            name: name.into(),
            shape,
            dtype,
            kind,
            dim_order: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub values: Vec<Value>,
    pub nodes: Vec<Node>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, value: Value) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(value);
        id
    }

    /// Declare a runtime input.
    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
    ) -> ValueId {
        let id = self.add_value(Value::new(name, shape, dtype, ValueKind::Input));
        self.inputs.push(id);
        id
    }

    /// Declare a parameter, buffer or constant whose data lives in the state dict.
    pub fn add_placeholder(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        kind: ValueKind,
    ) -> ValueId {
        self.add_value(Value::new(name, shape, dtype, kind))
    }

    /// Allocate an intermediate value with a unique name derived from `hint`.
    pub fn add_intermediate(&mut self, hint: &str, shape: Vec<usize>, dtype: DType) -> ValueId {
        let name = self.fresh_name(hint);
        self.add_value(Value::new(name, shape, dtype, ValueKind::Intermediate))
    }

    pub fn add_output(&mut self, value: ValueId) {
        self.outputs.push(value);
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0]
    }

    pub fn try_value(&self, id: ValueId) -> Result<&Value, IrError> {
        self.values.get(id.0).ok_or(IrError::ValueOutOfBounds {
            index: id.0,
            count: self.values.len(),
        })
    }

    pub fn shape(&self, id: ValueId) -> &[usize] {
        &self.values[id.0].shape
    }

    pub fn dtype(&self, id: ValueId) -> DType {
        self.values[id.0].dtype
    }

    pub fn find_value(&self, name: &str) -> Option<ValueId> {
        self.values.iter().position(|v| v.name == name).map(ValueId)
    }

    /// A name not yet used by any value or node. Returns `hint` itself when free.
    pub fn fresh_name(&self, hint: &str) -> String {
        let taken = |name: &str| {
            self.values.iter().any(|v| v.name == name) || self.nodes.iter().any(|n| n.name == name)
        };
        if !taken(hint) {
            return hint.to_string();
        }
        (1..)
            .map(|i| format!("{hint}_{i}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| hint.to_string())
    }

    /// Build a single-output node together with its output value. The node is
    /// not inserted; pass it to [`Graph::insert_nodes`] or [`Graph::replace_node`].
    pub fn create_node(
        &mut self,
        hint: &str,
        target: &str,
        args: Vec<Arg>,
        shape: Vec<usize>,
        dtype: DType,
    ) -> Node {
        let out = self.add_intermediate(hint, shape, dtype);
        let name = self.value(out).name.clone();
        Node::new(name, target, args, vec![out])
    }

    pub fn push_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn insert_nodes(&mut self, index: usize, nodes: Vec<Node>) {
        let tail = self.nodes.split_off(index);
        self.nodes.extend(nodes);
        self.nodes.extend(tail);
    }

    /// Replace the node at `index` with `nodes`. Uses of the old outputs are
    /// left untouched.
    pub fn replace_node(&mut self, index: usize, nodes: Vec<Node>) -> Node {
        let removed = self.nodes.remove(index);
        self.insert_nodes(index, nodes);
        removed
    }

    pub fn remove_node(&mut self, index: usize) -> Node {
        self.nodes.remove(index)
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Index of the node producing `value`, `None` for placeholders.
    pub fn producer(&self, value: ValueId) -> Option<usize> {
        self.nodes.iter().position(|n| n.outputs.contains(&value))
    }

    pub fn producer_node(&self, value: ValueId) -> Option<&Node> {
        self.producer(value).map(|i| &self.nodes[i])
    }

    /// Indices of nodes consuming `value`.
    pub fn users(&self, value: ValueId) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.uses(value))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_output(&self, value: ValueId) -> bool {
        self.outputs.contains(&value)
    }

    /// Rewrite uses of `from` into `to` in nodes at or after `start` and in the
    /// graph outputs.
    pub fn replace_uses_from(&mut self, start: usize, from: ValueId, to: ValueId) -> bool {
        let mut changed = false;
        for node in self.nodes.iter_mut().skip(start) {
            changed |= node.replace_input(from, to);
        }
        for out in self.outputs.iter_mut().filter(|o| **o == from) {
            *out = to;
            changed = true;
        }
        changed
    }

    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) -> bool {
        self.replace_uses_from(0, from, to)
    }

    /// Remove nodes whose outputs are never consumed. Returns whether any
    /// node was removed.
    pub fn eliminate_dead_code(&mut self) -> bool {
        let mut live: HashSet<ValueId> = self.outputs.iter().copied().collect();
        let mut keep = vec![false; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate().rev() {
            if node.outputs.iter().any(|o| live.contains(o)) {
                keep[i] = true;
                live.extend(node.inputs());
            }
        }
        let before = self.nodes.len();
        let mut flags = keep.into_iter();
        self.nodes.retain(|_| flags.next().unwrap_or(true));
        before != self.nodes.len()
    }

    /// Static values referenced by any node or graph output.
    pub fn used_static_values(&self) -> Vec<ValueId> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let referenced = self
            .nodes
            .iter()
            .flat_map(|n| n.inputs())
            .chain(self.outputs.iter().copied());
        for id in referenced {
            if self.value(id).kind.is_static() && seen.insert(id) {
                result.push(id);
            }
        }
        result
    }

    /// Count of nodes per target, sorted by target.
    pub fn op_histogram(&self) -> Vec<(String, usize)> {
        let mut counts = std::collections::BTreeMap::<&str, usize>::new();
        for node in &self.nodes {
            *counts.entry(node.target.as_str()).or_default() += 1;
        }
        counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    pub fn validate(&self) -> Result<(), IrError> {
        validate_graph(self)
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &id in &self.inputs {
            let v = self.value(id);
            writeln!(f, "input {} {}: {}{:?}", id, v.name, v.dtype, v.shape)?;
        }
        for node in &self.nodes {
            let outs: Vec<String> = node.outputs.iter().map(|o| o.to_string()).collect();
            let args: Vec<String> = node
                .args
                .iter()
                .map(|a| match a {
                    Arg::Value(v) => v.to_string(),
                    Arg::Values(vs) => format!(
                        "[{}]",
                        vs.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
                    ),
                    Arg::Int(i) => i.to_string(),
                    Arg::Ints(is) => format!("{is:?}"),
                    Arg::Float(x) => x.to_string(),
                    Arg::Floats(xs) => format!("{xs:?}"),
                    Arg::Bool(b) => b.to_string(),
                    Arg::DType(d) => d.to_string(),
                    Arg::Str(s) => format!("{s:?}"),
                    Arg::None => "None".to_string(),
                })
                .collect();
            let out = self.value(node.output());
            writeln!(
                f,
                "{} = {}({}) : {}{:?}",
                outs.join(", "),
                node.target,
                args.join(", "),
                out.dtype,
                out.shape
            )?;
        }
        let outs: Vec<String> = self.outputs.iter().map(|o| o.to_string()).collect();
        writeln!(f, "return ({})", outs.join(", "))
    }
}
