//! Helpers shared by the pass bodies: argument access with legalization
//! errors, shape arithmetic and node builders.

use tosalower_ir::ops::{aten, quantized};
use tosalower_ir::{Arg, DType, Graph, Node, ValueId};

use crate::error::{LoweringError, Result};

/// Binary elementwise operators whose operands broadcast against each other.
pub(crate) const BINARY_ELEMENTWISE: &[&str] = &[
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
    aten::LOGICAL_AND,
    aten::LOGICAL_OR,
    aten::LOGICAL_XOR,
    aten::BITWISE_AND,
    aten::BITWISE_OR,
    aten::BITWISE_XOR,
    aten::LSHIFT,
    aten::RSHIFT,
];

/// Operators that move data without looking at it. Their output dtype
/// follows their first input.
pub(crate) const DATA_MOVEMENT: &[&str] = &[
    aten::VIEW,
    aten::PERMUTE,
    aten::SQUEEZE,
    aten::UNSQUEEZE,
    aten::SELECT,
    aten::SLICE,
    aten::SPLIT,
    aten::CAT,
    aten::EXPAND,
    aten::REPEAT,
    aten::CLONE,
    aten::CONSTANT_PAD_ND,
    aten::MAX_POOL2D,
    aten::MAX_POOL2D_WITH_INDICES,
];

pub(crate) fn value_arg(pass: &'static str, node: &Node, index: usize) -> Result<ValueId> {
    node.value_arg(index).ok_or_else(|| {
        LoweringError::legalization(pass, &node.name, format!("argument {index} must be a tensor"))
    })
}

pub(crate) fn int_arg(pass: &'static str, node: &Node, index: usize) -> Result<i64> {
    node.int_arg(index).ok_or_else(|| {
        let message = format!("argument {index} must be an integer");
        LoweringError::legalization(pass, &node.name, message)
    })
}

pub(crate) fn ints_arg(pass: &'static str, node: &Node, index: usize) -> Result<Vec<i64>> {
    match node.arg(index) {
        Some(Arg::Ints(v)) => Ok(v.clone()),
        Some(Arg::Int(v)) => Ok(vec![*v]),
        _ => Err(LoweringError::legalization(
            pass,
            &node.name,
            format!("argument {index} must be an integer list"),
        )),
    }
}

pub(crate) fn float_arg(pass: &'static str, node: &Node, index: usize) -> Result<f64> {
    node.float_arg(index).ok_or_else(|| {
        LoweringError::legalization(pass, &node.name, format!("argument {index} must be a number"))
    })
}

/// Resolve a possibly negative dimension against `rank`.
pub(crate) fn normalize_dim(
    pass: &'static str,
    node: &Node,
    dim: i64,
    rank: usize,
) -> Result<usize> {
    let r = rank as i64;
    let d = if dim < 0 { dim + r } else { dim };
    if d < 0 || d >= r.max(1) {
        return Err(LoweringError::legalization(
            pass,
            &node.name,
            format!("dimension {dim} out of range for rank {rank}"),
        ));
    }
    Ok(d as usize)
}

pub(crate) fn normalize_dims(
    pass: &'static str,
    node: &Node,
    dims: &[i64],
    rank: usize,
) -> Result<Vec<usize>> {
    let mut out = dims
        .iter()
        .map(|&d| normalize_dim(pass, node, d, rank))
        .collect::<Result<Vec<_>>>()?;
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Numpy-style broadcast of two shapes.
pub(crate) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

pub(crate) fn reduced_shape(shape: &[usize], dims: &[usize], keepdim: bool) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (dims.contains(&i), keepdim) {
            (true, true) => Some(1),
            (true, false) => None,
            (false, _) => Some(d),
        })
        .collect()
}

pub(crate) fn to_ints(shape: &[usize]) -> Vec<i64> {
    shape.iter().map(|&d| d as i64).collect()
}

/// `full(shape, value)` shaped `[1; rank]` so it broadcasts against any
/// operand of that rank.
pub(crate) fn full_scalar(
    graph: &mut Graph,
    hint: &str,
    rank: usize,
    value: f64,
    dtype: DType,
) -> Node {
    let shape = vec![1; rank.max(1)];
    graph.create_node(
        hint,
        aten::FULL,
        vec![Arg::Ints(to_ints(&shape)), Arg::Float(value), Arg::DType(dtype)],
        shape,
        dtype,
    )
}

pub(crate) fn view(graph: &mut Graph, hint: &str, input: ValueId, shape: Vec<usize>) -> Node {
    let dtype = graph.dtype(input);
    graph.create_node(
        hint,
        aten::VIEW,
        vec![Arg::Value(input), Arg::Ints(to_ints(&shape))],
        shape,
        dtype,
    )
}

pub(crate) fn unary(graph: &mut Graph, hint: &str, target: &str, input: ValueId) -> Node {
    let shape = graph.shape(input).to_vec();
    let dtype = graph.dtype(input);
    graph.create_node(hint, target, vec![Arg::Value(input)], shape, dtype)
}

/// Broadcasting binary node; comparisons produce `bool`.
pub(crate) fn binary(graph: &mut Graph, hint: &str, target: &str, a: ValueId, b: ValueId) -> Node {
    let shape = broadcast_shapes(graph.shape(a), graph.shape(b))
        .unwrap_or_else(|| graph.shape(a).to_vec());
    let dtype = if is_comparison(target) {
        DType::Bool
    } else {
        graph.dtype(a).promote(graph.dtype(b))
    };
    graph.create_node(hint, target, vec![Arg::Value(a), Arg::Value(b)], shape, dtype)
}

pub(crate) fn is_comparison(target: &str) -> bool {
    [aten::EQ, aten::NE, aten::GT, aten::GE, aten::LT, aten::LE].contains(&target)
}

/// Sum over `dims` keeping reduced dimensions.
pub(crate) fn sum_keepdim(graph: &mut Graph, hint: &str, input: ValueId, dims: &[usize]) -> Node {
    let shape = reduced_shape(graph.shape(input), dims, true);
    let dtype = graph.dtype(input);
    graph.create_node(
        hint,
        aten::SUM,
        vec![
            Arg::Value(input),
            Arg::Ints(dims.iter().map(|&d| d as i64).collect()),
            Arg::Bool(true),
        ],
        shape,
        dtype,
    )
}

/// A node with the identity (name, outputs, meta) of `original` but a new
/// target and arguments. Used as the last node of a rewrite so downstream
/// uses stay valid.
pub(crate) fn retarget(original: &Node, target: &str, args: Vec<Arg>) -> Node {
    let mut node = Node::new(original.name.clone(), target, args, original.outputs.clone());
    node.meta = original.meta.clone();
    node
}

/// Make the last node of a decomposition write the outputs of `original`.
pub(crate) fn adopt(mut nodes: Vec<Node>, original: &Node) -> Vec<Node> {
    if let Some(last) = nodes.last_mut() {
        last.name = original.name.clone();
        last.outputs = original.outputs.clone();
        last.meta = original.meta.clone();
    }
    nodes
}

/// `where(condition, a, b)`.
pub(crate) fn select(
    graph: &mut Graph,
    hint: &str,
    condition: ValueId,
    a: ValueId,
    b: ValueId,
) -> Node {
    let shape = broadcast_shapes(graph.shape(a), graph.shape(b))
        .and_then(|s| broadcast_shapes(&s, graph.shape(condition)))
        .unwrap_or_else(|| graph.shape(a).to_vec());
    let dtype = graph.dtype(a).promote(graph.dtype(b));
    graph.create_node(
        hint,
        aten::WHERE,
        vec![Arg::Value(condition), Arg::Value(a), Arg::Value(b)],
        shape,
        dtype,
    )
}

/// Dimensions argument that may be `None` (all dimensions).
pub(crate) fn dims_or_all(
    pass: &'static str,
    node: &Node,
    index: usize,
    rank: usize,
) -> Result<Vec<usize>> {
    match node.arg(index) {
        None | Some(Arg::None) => Ok((0..rank).collect()),
        Some(Arg::Ints(dims)) if dims.is_empty() => Ok((0..rank).collect()),
        Some(_) => normalize_dims(pass, node, &ints_arg(pass, node, index)?, rank),
    }
}

/// Accumulates the nodes of a decomposition. The last node pushed takes over
/// the identity of the decomposed node in [`Decomposition::finish`].
pub(crate) struct Decomposition<'g> {
    pub graph: &'g mut Graph,
    hint: String,
    nodes: Vec<Node>,
}

impl<'g> Decomposition<'g> {
    pub fn new(graph: &'g mut Graph, original: &Node) -> Self {
        Decomposition {
            graph,
            hint: original.name.clone(),
            nodes: Vec::new(),
        }
    }

    pub fn push(&mut self, node: Node) -> ValueId {
        let out = node.output();
        self.nodes.push(node);
        out
    }

    pub fn extend(&mut self, nodes: Vec<Node>) {
        self.nodes.extend(nodes);
    }

    fn hint(&self, suffix: &str) -> String {
        format!("{}_{}", self.hint, suffix)
    }

    pub fn node(
        &mut self,
        target: &str,
        args: Vec<Arg>,
        shape: Vec<usize>,
        dtype: DType,
    ) -> ValueId {
        let hint = self.hint(ops_short(target));
        let node = self.graph.create_node(&hint, target, args, shape, dtype);
        self.push(node)
    }

    /// `full` broadcastable against `like`, in its float type.
    pub fn constant(&mut self, like: ValueId, value: f64) -> ValueId {
        let dtype = match self.graph.dtype(like) {
            d if d.is_float() => d,
            _ => DType::Float32,
        };
        let rank = self.graph.shape(like).len();
        let hint = self.hint("const");
        let node = full_scalar(self.graph, &hint, rank, value, dtype);
        self.push(node)
    }

    pub fn unary(&mut self, target: &str, x: ValueId) -> ValueId {
        let hint = self.hint(ops_short(target));
        let node = unary(self.graph, &hint, target, x);
        self.push(node)
    }

    pub fn binary(&mut self, target: &str, a: ValueId, b: ValueId) -> ValueId {
        let hint = self.hint(ops_short(target));
        let node = binary(self.graph, &hint, target, a, b);
        self.push(node)
    }

    pub fn select(&mut self, condition: ValueId, a: ValueId, b: ValueId) -> ValueId {
        let hint = self.hint("where");
        let node = select(self.graph, &hint, condition, a, b);
        self.push(node)
    }

    pub fn sum(&mut self, x: ValueId, dims: &[usize]) -> ValueId {
        let hint = self.hint("sum");
        let node = sum_keepdim(self.graph, &hint, x, dims);
        self.push(node)
    }

    pub fn view(&mut self, x: ValueId, shape: Vec<usize>) -> ValueId {
        let hint = self.hint("view");
        let node = view(self.graph, &hint, x, shape);
        self.push(node)
    }

    /// Reshape `x` to the shape of `original`'s output when they differ.
    pub fn view_as_output(&mut self, x: ValueId, original: &Node) -> ValueId {
        let target = self.graph.shape(original.output()).to_vec();
        if self.graph.shape(x) == target.as_slice() && !self.nodes.is_empty() {
            return x;
        }
        self.view(x, target)
    }

    pub fn finish(self, original: &Node) -> Option<Vec<Node>> {
        Some(adopt(self.nodes, original))
    }
}

fn ops_short(target: &str) -> &str {
    tosalower_ir::ops::short_name(target).trim_start_matches('_')
}

/// Rewrite every node whose target is in `targets`.
///
/// `rewrite` returns the replacement nodes (the last one must write the
/// original outputs) or `None` to leave the node alone. Replacement nodes are
/// not revisited.
pub(crate) fn rewrite_each<F>(graph: &mut Graph, targets: &[&str], mut rewrite: F) -> Result<bool>
where
    F: FnMut(&mut Graph, &Node) -> Result<Option<Vec<Node>>>,
{
    let mut changed = false;
    let mut i = 0;
    while i < graph.nodes.len() {
        if !targets.contains(&graph.nodes[i].target.as_str()) {
            i += 1;
            continue;
        }
        let node = graph.nodes[i].clone();
        match rewrite(graph, &node)? {
            Some(replacement) => {
                let count = replacement.len();
                graph.replace_node(i, replacement);
                i += count;
                changed = true;
            }
            None => i += 1,
        }
    }
    Ok(changed)
}

/// Dequantize node producing `value`, if any.
pub(crate) fn dequantize_producer(graph: &Graph, value: ValueId) -> Option<&Node> {
    graph
        .producer_node(value)
        .filter(|n| quantized::is_dequantize(&n.target))
}

/// Position of a channel axis after a reshape from `old` to `new`: the axis
/// whose leading element count and extent match.
fn moved_axis(old: &[usize], new: &[usize], axis: usize) -> Option<usize> {
    let leading: usize = old.get(..axis)?.iter().product();
    let extent = *old.get(axis)?;
    (0..new.len()).find(|&a| new[..a].iter().product::<usize>() == leading && new[a] == extent)
}

/// Apply a data-movement rewrite to `input`, placing it before a dequantize
/// when `input` comes from one so the quantized producer/consumer pairing
/// survives the rewrite.
pub(crate) fn move_before_dequant<F>(
    graph: &mut Graph,
    input: ValueId,
    build: F,
) -> (Vec<Node>, ValueId)
where
    F: FnOnce(&mut Graph, ValueId) -> (Vec<Node>, ValueId),
{
    let Some(dq) = dequantize_producer(graph, input).cloned() else {
        return build(graph, input);
    };
    let Some(quantized_input) = dq.value_arg(0) else {
        return build(graph, input);
    };
    let old_shape = graph.shape(quantized_input).to_vec();
    let (mut nodes, moved) = build(graph, quantized_input);
    let shape = graph.shape(moved).to_vec();
    let dtype = graph.dtype(input);
    let mut args = dq.args.clone();
    args[0] = Arg::Value(moved);
    if dq.is(quantized::DEQUANTIZE_PER_CHANNEL) {
        let axis = dq.int_arg(3).unwrap_or(0).max(0) as usize;
        let new_axis = moved_axis(&old_shape, &shape, axis).unwrap_or(axis);
        args[3] = Arg::Int(new_axis as i64);
    }
    let new_dq = graph.create_node(&dq.name, &dq.target, args, shape, dtype);
    let out = new_dq.output();
    nodes.push(new_dq);
    (nodes, out)
}

/// Reshape `produced` into `original` (same element count). When every user
/// of `original` is a per-tensor quantize, the quantize nodes are moved in
/// front of the reshape instead. Returns the nodes to append to the rewrite.
pub(crate) fn reshape_into(graph: &mut Graph, produced: ValueId, original: ValueId) -> Vec<Node> {
    let users = graph.users(original);
    let all_quantize = !users.is_empty()
        && !graph.is_output(original)
        && users
            .iter()
            .all(|&u| graph.nodes[u].is(quantized::QUANTIZE_PER_TENSOR));

    if !all_quantize {
        let shape = graph.shape(original).to_vec();
        let name = graph.fresh_name(&format!("{}_view", graph.value(original).name));
        return vec![Node::new(
            name,
            aten::VIEW,
            vec![Arg::Value(produced), Arg::Ints(to_ints(&shape))],
            vec![original],
        )];
    }

    for &u in users.iter().rev() {
        let q_old_out = graph.nodes[u].output();
        let q_dtype = graph.dtype(q_old_out);
        let moved_shape = graph.shape(produced).to_vec();
        let q_name = graph.nodes[u].name.clone();
        let q_new_out = graph.add_intermediate(&format!("{q_name}_moved"), moved_shape, q_dtype);
        let q_node = &mut graph.nodes[u];
        q_node.replace_input(original, produced);
        q_node.outputs = vec![q_new_out];
        let shape = graph.shape(q_old_out).to_vec();
        let view_name = graph.fresh_name(&format!("{q_name}_view"));
        graph.insert_nodes(
            u + 1,
            vec![Node::new(
                view_name,
                aten::VIEW,
                vec![Arg::Value(q_new_out), Arg::Ints(to_ints(&shape))],
                vec![q_old_out],
            )],
        );
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[2, 1, 4], &[3, 1]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shapes(&[2], &[3]), None);
        assert_eq!(broadcast_shapes(&[], &[5]), Some(vec![5]));
    }

    #[test]
    fn test_reduced_shape() {
        assert_eq!(reduced_shape(&[2, 3, 4], &[1], true), vec![2, 1, 4]);
        assert_eq!(reduced_shape(&[2, 3, 4], &[0, 2], false), vec![3]);
    }
}
