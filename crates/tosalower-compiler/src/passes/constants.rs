//! Compile-time evaluation over static data.
//!
//! Parameters, buffers and lifted constants have their data in the state
//! dict, so anything computed only from them can be folded before lowering.

use tosalower_ir::ops::aten;
use tosalower_ir::program::{add_constant, lookup};
use tosalower_ir::tensor::strides;
use tosalower_ir::{Arg, DType, Graph, Node, StateDict, TensorData, ValueId};

use super::util::{normalize_dim, retarget, value_arg};
use super::{GraphPass, ProgramPass};
use crate::error::{LoweringError, Result};

/// Replace the node at `index` by `constant`, redirecting its output.
fn replace_with_constant(graph: &mut Graph, index: usize, constant: ValueId) {
    let out = graph.nodes[index].output();
    graph.replace_all_uses(out, constant);
    graph.remove_node(index);
}

unit_pass!(
    /// Folds `full` into a constant.
    ComputeConstantOpsAOT
);

impl ProgramPass for ComputeConstantOpsAOT {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            let node = &graph.nodes[i];
            if !node.is(aten::FULL) {
                i += 1;
                continue;
            }
            let out = node.output();
            let fill = node.float_arg(1).unwrap_or(0.0);
            let data = TensorData::full(graph.dtype(out), graph.shape(out).to_vec(), fill);
            let hint = format!("{}_const", node.name);
            let constant = add_constant(graph, state, &hint, data);
            replace_with_constant(graph, i, constant);
            changed = true;
        }
        Ok(changed)
    }
}

/// Concatenate `pieces` along `dim`.
fn concat(pieces: &[&TensorData], dim: usize, dtype: DType) -> Result<TensorData> {
    let Some(first) = pieces.first() else {
        return Err(LoweringError::invalid_argument("cat", "no tensors to concatenate"));
    };
    let outer: usize = first.shape[..dim].iter().product();
    let mut shape = first.shape.clone();
    shape[dim] = pieces.iter().map(|p| p.shape[dim]).sum();
    let blocks: Vec<(Vec<f64>, usize)> = pieces
        .iter()
        .map(|p| (p.to_f64_vec(), strides(&p.shape)[dim] * p.shape[dim]))
        .collect();
    let mut values = Vec::with_capacity(shape.iter().product());
    for o in 0..outer {
        for (data, block) in &blocks {
            values.extend_from_slice(&data[o * block..(o + 1) * block]);
        }
    }
    Ok(TensorData::from_f64(dtype, shape, values)?)
}

/// Evaluate a data-movement node over static inputs.
fn evaluate(graph: &Graph, node: &Node, inputs: &[&TensorData]) -> Result<Option<TensorData>> {
    let out = node.output();
    let out_shape = graph.shape(out).to_vec();
    let Some(first) = inputs.first() else {
        return Ok(None);
    };
    let data = match node.target.as_str() {
        aten::VIEW | aten::SQUEEZE | aten::UNSQUEEZE => first.reshape(out_shape)?,
        aten::PERMUTE => {
            let perm: Vec<usize> = node
                .ints_arg(1)
                .unwrap_or_default()
                .iter()
                .map(|&p| p.rem_euclid(first.rank().max(1) as i64) as usize)
                .collect();
            first.permute(&perm)?
        }
        aten::SLICE => {
            let dim = node.int_arg(1).unwrap_or(0);
            let dim = normalize_dim(FuseConstantArgsPass::NAME, node, dim, first.rank())?;
            let size = first.shape[dim] as i64;
            let clamp = |v: i64| (if v < 0 { v + size } else { v }).clamp(0, size) as usize;
            let start = clamp(node.int_arg(2).unwrap_or(0));
            let end = clamp(node.int_arg(3).unwrap_or(size));
            let step = node.int_arg(4).unwrap_or(1).max(1) as usize;
            first.slice(dim, start, end, step)?
        }
        aten::REPEAT => {
            let multiples: Vec<usize> = node
                .ints_arg(1)
                .unwrap_or_default()
                .iter()
                .map(|&m| m.max(0) as usize)
                .collect();
            first.repeat(&multiples)?
        }
        aten::CAT => {
            let dim = node.int_arg(1).unwrap_or(0);
            let dim = normalize_dim(FuseConstantArgsPass::NAME, node, dim, first.rank())?;
            concat(inputs, dim, graph.dtype(out))?
        }
        aten::TO_COPY => first.cast(graph.dtype(out)),
        _ => return Ok(None),
    };
    Ok(Some(data))
}

const FOLDABLE: &[&str] = &[
    aten::VIEW,
    aten::SQUEEZE,
    aten::UNSQUEEZE,
    aten::PERMUTE,
    aten::SLICE,
    aten::REPEAT,
    aten::CAT,
    aten::TO_COPY,
];

unit_pass!(
    /// Folds data movement and casts whose inputs are all static.
    FuseConstantArgsPass
);

impl ProgramPass for FuseConstantArgsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            let node = &graph.nodes[i];
            if !FOLDABLE.contains(&node.target.as_str()) || node.outputs.len() != 1 {
                i += 1;
                continue;
            }
            let inputs: Option<Vec<&TensorData>> =
                node.inputs().map(|v| lookup(graph, state, v)).collect();
            let folded = match inputs {
                Some(inputs) if !inputs.is_empty() => evaluate(graph, node, &inputs)?,
                _ => None,
            };
            let Some(data) = folded else {
                i += 1;
                continue;
            };
            tracing::trace!(node = %node.name, "folding constant data movement");
            let hint = format!("{}_folded", node.name);
            let dim_order = graph.value(node.output()).dim_order.clone();
            let constant = add_constant(graph, state, &hint, data);
            graph.value_mut(constant).dim_order = dim_order;
            replace_with_constant(graph, i, constant);
            changed = true;
        }
        Ok(changed)
    }
}

unit_pass!(
    /// Gives every convolution an explicit bias: int32 zeros when the input
    /// is quantized, zeros of the input type otherwise.
    AddBiasPass
);

impl ProgramPass for AddBiasPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        for i in 0..graph.nodes.len() {
            let node = &graph.nodes[i];
            if !node.is(aten::CONVOLUTION) || !matches!(node.arg(2), Some(Arg::None) | None) {
                continue;
            }
            let x = value_arg(Self::NAME, node, 0)?;
            let w = value_arg(Self::NAME, node, 1)?;
            let channels = graph.shape(w).first().copied().unwrap_or(1);
            let dtype = if node.input_qparams(0).is_some() {
                DType::Int32
            } else {
                graph.dtype(x)
            };
            let hint = format!("{}_bias", node.name);
            let zeros = TensorData::full(dtype, vec![channels], 0.0);
            let bias = add_constant(graph, state, &hint, zeros);
            let node = &mut graph.nodes[i];
            node.args.resize(node.args.len().max(3), Arg::None);
            node.args[2] = Arg::Value(bias);
            changed = true;
        }
        Ok(changed)
    }
}

unit_pass!(
    /// Deduplicates static values with identical data.
    FuseEqualPlaceholdersPass
);

impl ProgramPass for FuseEqualPlaceholdersPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let statics = graph.used_static_values();
        let mut kept: Vec<ValueId> = Vec::new();
        let mut changed = false;
        for id in statics {
            let Some(data) = lookup(graph, state, id) else {
                continue;
            };
            let order = &graph.value(id).dim_order;
            let duplicate_of = kept.iter().copied().find(|&k| {
                graph.value(k).dim_order == *order && lookup(graph, state, k) == Some(data)
            });
            match duplicate_of {
                Some(original) => {
                    let name = graph.value(id).name.clone();
                    graph.replace_all_uses(id, original);
                    state.remove(&name);
                    changed = true;
                }
                None => kept.push(id),
            }
        }
        Ok(changed)
    }
}

fn static_channel_values(
    graph: &Graph,
    state: &StateDict,
    node: &Node,
    index: usize,
    channels: usize,
    default: f64,
) -> Result<Vec<f64>> {
    match node.value_arg(index) {
        None => Ok(vec![default; channels]),
        Some(v) => {
            let data = lookup(graph, state, v).ok_or_else(|| {
                LoweringError::legalization(
                    FuseBatchnorm2DPass::NAME,
                    &node.name,
                    format!("argument {index} must be static"),
                )
            })?;
            let values = data.to_f64_vec();
            if values.len() != channels {
                return Err(LoweringError::legalization(
                    FuseBatchnorm2DPass::NAME,
                    &node.name,
                    format!("argument {index} has {} values for {channels} channels", values.len()),
                ));
            }
            Ok(values)
        }
    }
}

unit_pass!(
    /// Folds inference batch norm into the preceding convolution when it
    /// owns static weights, and otherwise rewrites it as a per-channel
    /// multiply and add.
    FuseBatchnorm2DPass
);

impl FuseBatchnorm2DPass {
    /// `(scale, shift)` with `y = x * scale + shift` per channel.
    fn affine(
        graph: &Graph,
        state: &StateDict,
        node: &Node,
        channels: usize,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let gamma = static_channel_values(graph, state, node, 1, channels, 1.0)?;
        let beta = static_channel_values(graph, state, node, 2, channels, 0.0)?;
        let mean = static_channel_values(graph, state, node, 3, channels, 0.0)?;
        let var = static_channel_values(graph, state, node, 4, channels, 1.0)?;
        let eps = node.float_arg(6).unwrap_or(1e-5);
        let scale: Vec<f64> = gamma
            .iter()
            .zip(&var)
            .map(|(g, v)| g / (v + eps).sqrt())
            .collect();
        let shift = beta
            .iter()
            .zip(&mean)
            .zip(&scale)
            .map(|((b, m), s)| b - m * s)
            .collect();
        Ok((scale, shift))
    }

    /// Index of a convolution producing `x` that can absorb the batch norm.
    fn fusable_conv(graph: &Graph, state: &StateDict, x: ValueId) -> Option<usize> {
        let index = graph.producer(x)?;
        let conv = &graph.nodes[index];
        let owns_weight = conv
            .value_arg(1)
            .is_some_and(|w| {
                lookup(graph, state, w).is_some()
                    && graph.users(w).len() == 1
                    && !graph.is_output(w)
            });
        let bias_ok = conv
            .value_arg(2)
            .map_or(true, |b| lookup(graph, state, b).is_some() && graph.users(b).len() == 1);
        (conv.is(aten::CONVOLUTION)
            && !conv.bool_arg(6).unwrap_or(false)
            && !conv.meta.is_quantized()
            && owns_weight
            && bias_ok
            && graph.users(x).len() == 1
            && !graph.is_output(x))
        .then_some(index)
    }

    fn fold_into_conv(
        graph: &mut Graph,
        state: &mut StateDict,
        conv_index: usize,
        scale: &[f64],
        shift: &[f64],
    ) -> Result<()> {
        let conv = graph.nodes[conv_index].clone();
        let w = value_arg(Self::NAME, &conv, 1)?;
        let Some(weight) = lookup(graph, state, w).cloned() else {
            return Ok(());
        };
        let per_channel = weight.numel() / scale.len().max(1);
        let folded: Vec<f64> = weight
            .to_f64_vec()
            .iter()
            .enumerate()
            .map(|(i, v)| v * scale[i / per_channel])
            .collect();
        let bias: Vec<f64> = match conv.value_arg(2).and_then(|b| lookup(graph, state, b)) {
            Some(b) => b.to_f64_vec(),
            None => vec![0.0; scale.len()],
        };
        let bias: Vec<f64> = bias
            .iter()
            .zip(scale)
            .zip(shift)
            .map(|((b, s), t)| b * s + t)
            .collect();

        let w_data = TensorData::from_f64(weight.dtype, weight.shape.clone(), folded)?;
        let b_data = TensorData::from_f64(weight.dtype, vec![scale.len()], bias)?;
        let new_w = add_constant(graph, state, &format!("{}_fused_weight", conv.name), w_data);
        let new_b = add_constant(graph, state, &format!("{}_fused_bias", conv.name), b_data);
        let node = &mut graph.nodes[conv_index];
        node.args.resize(node.args.len().max(3), Arg::None);
        node.args[1] = Arg::Value(new_w);
        node.args[2] = Arg::Value(new_b);
        Ok(())
    }
}

impl ProgramPass for FuseBatchnorm2DPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            if !graph.nodes[i].is(aten::BATCH_NORM) {
                i += 1;
                continue;
            }
            let node = graph.nodes[i].clone();
            if node.outputs[1..].iter().any(|&o| !graph.users(o).is_empty() || graph.is_output(o)) {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    "batch statistics outputs are consumed",
                ));
            }
            let x = value_arg(Self::NAME, &node, 0)?;
            let shape = graph.shape(x).to_vec();
            let channels = shape.get(1).copied().unwrap_or(1);
            let (scale, shift) = Self::affine(graph, state, &node, channels)?;

            if let Some(conv_index) = Self::fusable_conv(graph, state, x) {
                Self::fold_into_conv(graph, state, conv_index, &scale, &shift)?;
                graph.replace_all_uses(node.output(), x);
                graph.remove_node(i);
                changed = true;
                continue;
            }

            let dtype = graph.dtype(x);
            let mut c_shape = vec![1; shape.len().max(2)];
            c_shape[1] = channels;
            let scale_data = TensorData::from_f64(dtype, c_shape.clone(), scale)?;
            let shift_data = TensorData::from_f64(dtype, c_shape, shift)?;
            let scale_c = add_constant(graph, state, &format!("{}_scale", node.name), scale_data);
            let shift_c = add_constant(graph, state, &format!("{}_shift", node.name), shift_data);
            let mul = graph.create_node(
                &format!("{}_mul", node.name),
                aten::MUL,
                vec![Arg::Value(x), Arg::Value(scale_c)],
                shape,
                dtype,
            );
            let mut add = retarget(
                &node,
                aten::ADD,
                vec![Arg::Value(mul.output()), Arg::Value(shift_c)],
            );
            add.outputs.truncate(1);
            graph.replace_node(i, vec![mul, add]);
            i += 2;
            changed = true;
        }
        Ok(changed)
    }
}

/// Stand-in for infinite scalars, inside every quantized range.
const INF_REPLACEMENT: f64 = 255.0;

fn finite(value: f64) -> f64 {
    match value {
        v if v == f64::INFINITY => INF_REPLACEMENT,
        v if v == f64::NEG_INFINITY => -INF_REPLACEMENT,
        v => v,
    }
}

unit_pass!(
    /// Replaces infinite scalar arguments with `±255` so observers and
    /// quantizers see finite ranges.
    ReplaceInfValues
);

impl GraphPass for ReplaceInfValues {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for node in &mut graph.nodes {
            for arg in &mut node.args {
                match arg {
                    Arg::Float(v) if v.is_infinite() => {
                        *v = finite(*v);
                        changed = true;
                    }
                    Arg::Floats(vs) if vs.iter().any(|v| v.is_infinite()) => {
                        vs.iter_mut().for_each(|v| *v = finite(*v));
                        changed = true;
                    }
                    _ => {}
                }
            }
        }
        Ok(changed)
    }
}
