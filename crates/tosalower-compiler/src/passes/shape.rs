//! Rank, broadcast and layout legalization.

use tosalower_ir::ops::aten;
use tosalower_ir::program::{add_constant, lookup};
use tosalower_ir::{Arg, Graph, Node, StateDict, ValueId};

use super::util::{ints_arg, rewrite_each, to_ints, value_arg, view, BINARY_ELEMENTWISE};
use super::{GraphPass, ProgramPass};
use crate::error::{LoweringError, Result};

/// Channels-last order of a rank-4 `NCHW` value.
pub const NHWC_ORDER: [usize; 4] = [0, 2, 3, 1];
/// Order of a depthwise weight `[C*M, 1, H, W]` stored as `[H, W, C*M, 1]`.
pub const DEPTHWISE_WEIGHT_ORDER: [usize; 4] = [2, 3, 0, 1];

/// Argument slots holding broadcasting operands.
fn broadcast_slots(node: &Node) -> &'static [usize] {
    if node.is(aten::WHERE) {
        &[0, 1, 2]
    } else {
        &[0, 1]
    }
}

fn broadcast_targets() -> Vec<&'static str> {
    let mut targets = BINARY_ELEMENTWISE.to_vec();
    targets.push(aten::WHERE);
    targets
}

unit_pass!(
    /// Left-pads the rank of broadcasting operands with unit dimensions.
    /// Static operands are reshaped in place when this node is their only
    /// user and copied otherwise.
    MatchArgRanksPass
);

impl ProgramPass for MatchArgRanksPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let targets = broadcast_targets();
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            if !targets.contains(&graph.nodes[i].target.as_str()) {
                i += 1;
                continue;
            }
            let node = graph.nodes[i].clone();
            let slots = broadcast_slots(&node);
            let operands: Vec<(usize, ValueId)> = slots
                .iter()
                .filter_map(|&s| node.value_arg(s).map(|v| (s, v)))
                .collect();
            let rank = operands
                .iter()
                .map(|&(_, v)| graph.shape(v).len())
                .max()
                .unwrap_or(0);

            let mut inserted = Vec::new();
            let mut rewired = node.clone();
            for (slot, value) in operands {
                let shape = graph.shape(value).to_vec();
                if shape.len() == rank {
                    continue;
                }
                let mut padded = vec![1; rank - shape.len()];
                padded.extend(&shape);
                let replacement = match lookup(graph, state, value).cloned() {
                    Some(data) if graph.users(value).len() == 1 && !graph.is_output(value) => {
                        let name = graph.value(value).name.clone();
                        state.insert(name, data.reshape(padded.clone())?);
                        graph.value_mut(value).shape = padded;
                        value
                    }
                    Some(data) => {
                        let hint = format!("{}_rank{rank}", graph.value(value).name);
                        add_constant(graph, state, &hint, data.reshape(padded)?)
                    }
                    None => {
                        let hint = format!("{}_unsqueeze_{slot}", node.name);
                        let v = view(graph, &hint, value, padded);
                        let out = v.output();
                        inserted.push(v);
                        out
                    }
                };
                rewired.args[slot] = Arg::Value(replacement);
                changed = true;
            }
            let count = inserted.len();
            graph.nodes[i] = rewired;
            graph.insert_nodes(i, inserted);
            i += count + 1;
        }
        Ok(changed)
    }
}

unit_pass!(
    /// Materializes implicit broadcasting with `repeat`, for targets whose
    /// elementwise operators require equal shapes.
    BroadcastArgsPass
);

impl GraphPass for BroadcastArgsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let targets = broadcast_targets();
        rewrite_each(graph, &targets, |graph, node| {
            let out_shape = graph.shape(node.output()).to_vec();
            let mut rewired = node.clone();
            let mut nodes = Vec::new();
            for &slot in broadcast_slots(node) {
                let Some(value) = node.value_arg(slot) else {
                    continue;
                };
                let shape = graph.shape(value).to_vec();
                if shape == out_shape {
                    continue;
                }
                if shape.len() != out_shape.len() {
                    return Err(LoweringError::legalization(
                        Self::NAME,
                        &node.name,
                        format!(
                            "operand {slot} has rank {}, expected {}",
                            shape.len(),
                            out_shape.len()
                        ),
                    ));
                }
                let multiples: Vec<i64> = shape
                    .iter()
                    .zip(&out_shape)
                    .map(|(&s, &o)| if s == o { 1 } else { o as i64 })
                    .collect();
                let dtype = graph.dtype(value);
                let hint = format!("{}_broadcast_{slot}", node.name);
                let repeat = graph.create_node(
                    &hint,
                    aten::REPEAT,
                    vec![Arg::Value(value), Arg::Ints(multiples)],
                    out_shape.clone(),
                    dtype,
                );
                rewired.args[slot] = Arg::Value(repeat.output());
                nodes.push(repeat);
            }
            if nodes.is_empty() {
                return Ok(None);
            }
            nodes.push(rewired);
            Ok(Some(nodes))
        })
    }
}

unit_pass!(
    /// Rank-0 static values become shape `[1]`.
    UnsqueezeScalarPlaceholdersPass
);

impl ProgramPass for UnsqueezeScalarPlaceholdersPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        for id in graph.used_static_values() {
            if !graph.shape(id).is_empty() {
                continue;
            }
            let name = graph.value(id).name.clone();
            if let Some(data) = state.get_mut(&name) {
                *data = data.reshape(vec![1])?;
            }
            graph.value_mut(id).shape = vec![1];
            changed = true;
        }
        Ok(changed)
    }
}

/// Elements left over at the end of a spatial dimension by a sliding
/// window: `(size + 2*pad - dilation*(kernel-1) - 1) mod stride`.
pub fn window_remainder(size: i64, pad: i64, kernel: i64, stride: i64, dilation: i64) -> i64 {
    (size + 2 * pad - dilation * (kernel - 1) - 1).rem_euclid(stride.max(1))
}

/// `(kernel, stride, padding, dilation)` per spatial dimension of a
/// windowed node.
fn window_params(
    graph: &Graph,
    node: &Node,
    pass: &'static str,
) -> Result<Option<[Vec<i64>; 4]>> {
    let params = if node.is(aten::CONVOLUTION) {
        let weight = value_arg(pass, node, 1)?;
        let shape = graph.shape(weight);
        if shape.len() != 4 || node.bool_arg(6).unwrap_or(false) {
            return Ok(None);
        }
        [
            to_ints(&shape[2..]),
            ints_arg(pass, node, 3)?,
            ints_arg(pass, node, 4)?,
            ints_arg(pass, node, 5)?,
        ]
    } else {
        let kernel = ints_arg(pass, node, 1)?;
        let stride = node.ints_arg(2).map(<[i64]>::to_vec).unwrap_or_default();
        let stride = if stride.is_empty() { kernel.clone() } else { stride };
        let padding = node.ints_arg(3).map(<[i64]>::to_vec).unwrap_or_default();
        let dilation = if node.is(aten::AVG_POOL2D) {
            Vec::new()
        } else {
            node.ints_arg(4).map(<[i64]>::to_vec).unwrap_or_default()
        };
        [kernel, stride, padding, dilation]
    };
    Ok(Some(params))
}

/// Entry `d` of a per-dimension list, broadcasting a single entry.
fn per_dim(values: &[i64], d: usize, default: i64) -> i64 {
    values.get(d).or(values.first()).copied().unwrap_or(default)
}

unit_pass!(
    /// Slices the input of convolutions and pools whose window leaves more
    /// trailing elements than the padding can absorb, so the backend's
    /// padding adjustment never has to grow the padding.
    SizeAdjustInputPass
);

impl GraphPass for SizeAdjustInputPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let targets = [
            aten::CONVOLUTION,
            aten::AVG_POOL2D,
            aten::MAX_POOL2D,
            aten::MAX_POOL2D_WITH_INDICES,
        ];
        rewrite_each(graph, &targets, |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            if graph.shape(x).len() != 4 {
                return Ok(None);
            }
            let params = window_params(graph, node, Self::NAME)?;
            let Some([kernel, stride, padding, dilation]) = params else {
                return Ok(None);
            };
            let mut nodes = Vec::new();
            let mut input = x;
            for (d, dim) in [2usize, 3].into_iter().enumerate() {
                let size = graph.shape(input)[dim] as i64;
                let pad = per_dim(&padding, d, 0);
                let remainder = window_remainder(
                    size,
                    pad,
                    per_dim(&kernel, d, 1),
                    per_dim(&stride, d, 1),
                    per_dim(&dilation, d, 1),
                );
                if remainder <= pad {
                    continue;
                }
                let end = size - (remainder - pad);
                let mut shape = graph.shape(input).to_vec();
                shape[dim] = end as usize;
                let dtype = graph.dtype(input);
                let slice = graph.create_node(
                    &format!("{}_size_adjust_{dim}", node.name),
                    aten::SLICE,
                    vec![
                        Arg::Value(input),
                        Arg::Int(dim as i64),
                        Arg::Int(0),
                        Arg::Int(end),
                        Arg::Int(1),
                    ],
                    shape,
                    dtype,
                );
                input = slice.output();
                nodes.push(slice);
            }
            if nodes.is_empty() {
                return Ok(None);
            }
            let mut rewired = node.clone();
            rewired.args[0] = Arg::Value(input);
            nodes.push(rewired);
            Ok(Some(nodes))
        })
    }
}

/// Depthwise convolutions have one group per input channel and a whole
/// number of output channels per group.
pub fn is_depthwise_channels(in_channels: usize, out_channels: usize, groups: i64) -> bool {
    in_channels > 0 && in_channels as i64 == groups && out_channels % in_channels == 0
}

/// Whether `node` is a convolution the backend lowers as depthwise.
pub fn is_depthwise(graph: &Graph, node: &Node) -> bool {
    let (Some(x), Some(w), Some(groups)) = (node.value_arg(0), node.value_arg(1), node.int_arg(8))
    else {
        return false;
    };
    let in_channels = graph.shape(x).get(1).copied().unwrap_or(0);
    let out_channels = graph.shape(w).first().copied().unwrap_or(0);
    is_depthwise_channels(in_channels, out_channels, groups)
}

unit_pass!(
    /// Records the channels-last memory order on every rank-4 value. Weights
    /// of depthwise convolutions get the `[H, W, C, M]` order the backend
    /// expects.
    AnnotateChannelsLastDimOrder
);

impl GraphPass for AnnotateChannelsLastDimOrder {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let depthwise_weights: Vec<ValueId> = graph
            .nodes
            .iter()
            .filter(|n| n.is(aten::CONVOLUTION) && is_depthwise(graph, n))
            .filter_map(|n| n.value_arg(1))
            .collect();
        let mut changed = false;
        for (index, value) in graph.values.iter_mut().enumerate() {
            if value.shape.len() != 4 {
                continue;
            }
            let order = if depthwise_weights.contains(&ValueId(index)) {
                DEPTHWISE_WEIGHT_ORDER
            } else {
                NHWC_ORDER
            };
            if value.dim_order.as_deref() != Some(&order[..]) {
                value.dim_order = Some(order.to_vec());
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tosalower_ir::{DType, TensorData, ValueKind};

    fn conv(
        g: &mut Graph,
        x: ValueId,
        w: ValueId,
        stride: i64,
        pad: i64,
        out: Vec<usize>,
    ) -> ValueId {
        let node = g.create_node(
            "conv",
            aten::CONVOLUTION,
            vec![
                Arg::Value(x),
                Arg::Value(w),
                Arg::None,
                Arg::Ints(vec![stride, stride]),
                Arg::Ints(vec![pad, pad]),
                Arg::Ints(vec![1, 1]),
                Arg::Bool(false),
                Arg::Ints(vec![0, 0]),
                Arg::Int(1),
            ],
            out,
            DType::Float32,
        );
        let o = node.output();
        g.push_node(node);
        o
    }

    #[test]
    fn test_window_remainder() {
        assert_eq!(window_remainder(8, 1, 3, 2, 1), 1);
        assert_eq!(window_remainder(7, 1, 3, 2, 1), 0);
        assert_eq!(window_remainder(9, 0, 2, 2, 1), 1);
    }

    #[test]
    fn test_size_adjust_slices_input() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![1, 2, 9, 8], DType::Float32);
        let w = g.add_placeholder("w", vec![4, 2, 2, 2], DType::Float32, ValueKind::Parameter);
        let out = conv(&mut g, x, w, 2, 0, vec![1, 4, 4, 4]);
        g.add_output(out);

        assert!(SizeAdjustInputPass.call(&mut g).unwrap());
        g.validate().unwrap();
        assert!(g.nodes[0].is(aten::SLICE));
        assert_eq!(g.nodes[0].int_arg(1), Some(2));
        assert_eq!(g.nodes[0].int_arg(3), Some(8));
        assert_eq!(g.shape(g.nodes[1].value_arg(0).unwrap()), &[1, 2, 8, 8]);
        assert!(!SizeAdjustInputPass.call(&mut g).unwrap());
    }

    #[test]
    fn test_match_ranks_static_and_dynamic() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![2, 3, 4], DType::Float32);
        let y = g.add_input("y", vec![4], DType::Float32);
        let c = g.add_placeholder("c", vec![4], DType::Float32, ValueKind::Constant);
        let add = g.create_node(
            "add",
            aten::ADD,
            vec![Arg::Value(x), Arg::Value(y)],
            vec![2, 3, 4],
            DType::Float32,
        );
        let add_out = add.output();
        g.push_node(add);
        let mul = g.create_node(
            "mul",
            aten::MUL,
            vec![Arg::Value(add_out), Arg::Value(c)],
            vec![2, 3, 4],
            DType::Float32,
        );
        let out = mul.output();
        g.push_node(mul);
        g.add_output(out);
        let mut state = StateDict::new();
        state.insert("c".into(), TensorData::full(DType::Float32, vec![4], 2.0));

        assert!(MatchArgRanksPass.call(&mut g, &mut state).unwrap());
        g.validate().unwrap();
        assert!(g.nodes[0].is(aten::VIEW));
        assert_eq!(g.shape(g.nodes[0].output()), &[1, 1, 4]);
        assert_eq!(g.shape(c), &[1, 1, 4]);
        assert_eq!(state["c"].shape, vec![1, 1, 4]);
        assert!(!MatchArgRanksPass.call(&mut g, &mut state).unwrap());
    }

    #[test]
    fn test_broadcast_inserts_repeat() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![2, 3], DType::Int8);
        let y = g.add_input("y", vec![1, 3], DType::Int8);
        let node = g.create_node(
            "add",
            aten::ADD,
            vec![Arg::Value(x), Arg::Value(y)],
            vec![2, 3],
            DType::Int8,
        );
        let out = node.output();
        g.push_node(node);
        g.add_output(out);

        assert!(BroadcastArgsPass.call(&mut g).unwrap());
        assert!(g.nodes[0].is(aten::REPEAT));
        assert_eq!(g.nodes[0].ints_arg(1), Some(&[2, 1][..]));
        assert!(!BroadcastArgsPass.call(&mut g).unwrap());
    }

    #[test]
    fn test_channels_last_annotation() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![1, 8, 6, 6], DType::Float32);
        let w = g.add_placeholder("w", vec![16, 1, 3, 3], DType::Float32, ValueKind::Parameter);
        let node = g.create_node(
            "dw",
            aten::CONVOLUTION,
            vec![
                Arg::Value(x),
                Arg::Value(w),
                Arg::None,
                Arg::Ints(vec![1, 1]),
                Arg::Ints(vec![0, 0]),
                Arg::Ints(vec![1, 1]),
                Arg::Bool(false),
                Arg::Ints(vec![0, 0]),
                Arg::Int(8),
            ],
            vec![1, 16, 4, 4],
            DType::Float32,
        );
        let out = node.output();
        g.push_node(node);
        g.add_output(out);

        assert!(AnnotateChannelsLastDimOrder.call(&mut g).unwrap());
        assert_eq!(g.value(x).dim_order.as_deref(), Some(&NHWC_ORDER[..]));
        assert_eq!(g.value(w).dim_order.as_deref(), Some(&DEPTHWISE_WEIGHT_ORDER[..]));
        assert!(!AnnotateChannelsLastDimOrder.call(&mut g).unwrap());
    }
}
