//! Rewrites of linear layers, convolutions and pools into the 2D forms the
//! visitors accept.

use tosalower_ir::ops::aten;
use tosalower_ir::{Arg, Graph, Node, QuantArgs, ValueId};

use super::super::util::{
    int_arg, ints_arg, move_before_dequant, reshape_into, retarget, rewrite_each, to_ints,
    value_arg, view,
};
use super::super::shape::is_depthwise_channels;
use super::super::{GraphPass};
use crate::error::{LoweringError, Result};

/// Arguments of a plain 2D convolution.
fn conv2d_args(
    input: ValueId,
    weight: ValueId,
    bias: Option<ValueId>,
    stride: Vec<i64>,
    padding: Vec<i64>,
    dilation: Vec<i64>,
    groups: i64,
) -> Vec<Arg> {
    vec![
        Arg::Value(input),
        Arg::Value(weight),
        bias.map_or(Arg::None, Arg::Value),
        Arg::Ints(stride),
        Arg::Ints(padding),
        Arg::Ints(dilation),
        Arg::Bool(false),
        Arg::Ints(vec![0, 0]),
        Arg::Int(groups),
    ]
}

unit_pass!(
    /// `linear` becomes a 1x1 convolution over `[M, K, 1, 1]`.
    DecomposeLinearPass
);

impl GraphPass for DecomposeLinearPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::LINEAR], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let w = value_arg(Self::NAME, node, 1)?;
            let bias = node.value_arg(2);
            let x_shape = graph.shape(x).to_vec();
            let w_shape = graph.shape(w).to_vec();
            let (Some(&k), [n, wk]) = (x_shape.last(), w_shape.as_slice()) else {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    "weight must be [out_features, in_features]",
                ));
            };
            if k != *wk {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    format!("input features {k} do not match weight features {wk}"),
                ));
            }
            let n = *n;
            let m: usize = x_shape[..x_shape.len() - 1].iter().product();

            let mut nodes = Vec::new();
            let mut reshape = |graph: &mut Graph, value: ValueId, shape: Vec<usize>, hint: &str| {
                let (created, out) = move_before_dequant(graph, value, |graph, v| {
                    let node = view(graph, hint, v, shape);
                    let out = node.output();
                    (vec![node], out)
                });
                nodes.extend(created);
                out
            };
            let x4 = reshape(graph, x, vec![m, k, 1, 1], &format!("{}_input", node.name));
            let w4 = reshape(graph, w, vec![n, k, 1, 1], &format!("{}_weight", node.name));

            let dtype = graph.dtype(node.output());
            let mut conv = graph.create_node(
                &format!("{}_conv", node.name),
                aten::CONVOLUTION,
                conv2d_args(x4, w4, bias, vec![1, 1], vec![0, 0], vec![1, 1], 1),
                vec![m, n, 1, 1],
                dtype,
            );
            conv.meta = node.meta.clone();
            let produced = conv.output();
            nodes.push(conv);
            nodes.extend(reshape_into(graph, produced, node.output()));
            Ok(Some(nodes))
        })
    }
}

/// Parameters of channels `[start, end)` of per-channel `params`.
fn slice_channels(params: &QuantArgs, start: usize, end: usize) -> QuantArgs {
    if !params.is_per_channel() {
        return params.clone();
    }
    let mut sliced = params.clone();
    sliced.scales = params.scales[start..end].to_vec();
    sliced.zero_points = params.zero_points[start..end].to_vec();
    sliced
}

unit_pass!(
    /// Grouped (non-depthwise) convolution becomes one convolution per group
    /// joined by `cat` along channels.
    DecomposeGroupedConv
);

impl GraphPass for DecomposeGroupedConv {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::CONVOLUTION], |graph, node| {
            let groups = node.int_arg(8).unwrap_or(1).max(1) as usize;
            if groups == 1 {
                return Ok(None);
            }
            let x = value_arg(Self::NAME, node, 0)?;
            let w = value_arg(Self::NAME, node, 1)?;
            let bias = node.value_arg(2);
            let in_channels = graph.shape(x)[1];
            let out_channels = graph.shape(w)[0];
            if is_depthwise_channels(in_channels, out_channels, groups as i64) {
                // Depthwise, lowered directly.
                return Ok(None);
            }
            if in_channels % groups != 0 || out_channels % groups != 0 {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    format!(
                        "{groups} groups do not divide {in_channels} -> {out_channels} channels"
                    ),
                ));
            }
            let in_per_group = in_channels / groups;
            let out_per_group = out_channels / groups;
            let out_shape = graph.shape(node.output()).to_vec();
            let dtype = graph.dtype(node.output());

            let slice = |graph: &mut Graph, value: ValueId, dim: usize, start: usize, len: usize| {
                let mut shape = graph.shape(value).to_vec();
                shape[dim] = len;
                let dtype = graph.dtype(value);
                let hint = format!("{}_slice", graph.value(value).name);
                graph.create_node(
                    &hint,
                    aten::SLICE,
                    vec![
                        Arg::Value(value),
                        Arg::Int(dim as i64),
                        Arg::Int(start as i64),
                        Arg::Int((start + len) as i64),
                        Arg::Int(1),
                    ],
                    shape,
                    dtype,
                )
            };

            let mut nodes = Vec::new();
            let mut pieces = Vec::with_capacity(groups);
            for g in 0..groups {
                let x_g = slice(graph, x, 1, g * in_per_group, in_per_group);
                let w_start = g * out_per_group;
                let w_g = slice(graph, w, 0, w_start, out_per_group);
                let b_g = bias.map(|b| slice(graph, b, 0, w_start, out_per_group));

                let mut args = node.args.clone();
                args[0] = Arg::Value(x_g.output());
                args[1] = Arg::Value(w_g.output());
                if let Some(b) = &b_g {
                    args[2] = Arg::Value(b.output());
                }
                args[8] = Arg::Int(1);
                let mut shape = out_shape.clone();
                shape[1] = out_per_group;
                let hint = format!("{}_group_{g}", node.name);
                let mut conv = graph.create_node(&hint, aten::CONVOLUTION, args, shape, dtype);
                conv.meta = node.meta.clone();
                for slot in [1, 2] {
                    if let Some(params) = node.input_qparams(slot) {
                        conv.meta
                            .input_qparams
                            .insert(slot, slice_channels(params, w_start, w_start + out_per_group));
                    }
                }
                pieces.push(conv.output());
                nodes.push(x_g);
                nodes.push(w_g);
                nodes.extend(b_g);
                nodes.push(conv);
            }
            let mut cat = Node::new(
                node.name.clone(),
                aten::CAT,
                vec![Arg::Values(pieces), Arg::Int(1)],
                node.outputs.clone(),
            );
            if let Some(params) = node.output_qparams(0) {
                cat.meta.output_qparams.insert(0, params.clone());
            }
            nodes.push(cat);
            Ok(Some(nodes))
        })
    }
}

unit_pass!(
    /// 1D convolution becomes a 2D convolution over a unit-height view.
    Conv1dUnsqueezePass
);

impl GraphPass for Conv1dUnsqueezePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::CONVOLUTION], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            if graph.shape(x).len() != 3 {
                return Ok(None);
            }
            let w = value_arg(Self::NAME, node, 1)?;
            let first = |v: Vec<i64>, default: i64| v.first().copied().unwrap_or(default);
            let stride = first(ints_arg(Self::NAME, node, 3)?, 1);
            let padding = first(ints_arg(Self::NAME, node, 4)?, 0);
            let dilation = first(ints_arg(Self::NAME, node, 5)?, 1);
            let groups = int_arg(Self::NAME, node, 8)?;

            let unsqueeze = |shape: &[usize]| vec![shape[0], shape[1], 1, shape[2]];
            let x_shape = unsqueeze(graph.shape(x));
            let w_shape = unsqueeze(graph.shape(w));
            let out = node.output();
            let out_shape = unsqueeze(graph.shape(out));

            let x4 = view(graph, &format!("{}_input", node.name), x, x_shape);
            let w4 = view(graph, &format!("{}_weight", node.name), w, w_shape);
            let mut conv = graph.create_node(
                &format!("{}_conv2d", node.name),
                aten::CONVOLUTION,
                conv2d_args(
                    x4.output(),
                    w4.output(),
                    node.value_arg(2),
                    vec![1, stride],
                    vec![0, padding],
                    vec![1, dilation],
                    groups,
                ),
                out_shape,
                graph.dtype(out),
            );
            conv.meta = node.meta.clone();
            let squeeze = Node::new(
                node.name.clone(),
                aten::VIEW,
                vec![Arg::Value(conv.output()), Arg::Ints(to_ints(graph.shape(out)))],
                node.outputs.clone(),
            );
            Ok(Some(vec![x4, w4, conv, squeeze]))
        })
    }
}

unit_pass!(
    /// `adaptive_avg_pool2d` with output sizes dividing the input becomes
    /// `avg_pool2d`.
    DecomposeAdaptiveAvgPool2dPass
);

impl GraphPass for DecomposeAdaptiveAvgPool2dPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::ADAPTIVE_AVG_POOL2D], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let output_size = ints_arg(Self::NAME, node, 1)?;
            let shape = graph.shape(x);
            let rank = shape.len();
            if rank < 2 || output_size.len() != 2 {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    "expected a 2D output size",
                ));
            }
            let (h, w) = (shape[rank - 2] as i64, shape[rank - 1] as i64);
            let (oh, ow) = (output_size[0], output_size[1]);
            if oh <= 0 || ow <= 0 || h % oh != 0 || w % ow != 0 {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    format!("output size {oh}x{ow} does not divide input {h}x{w}"),
                ));
            }
            let kernel = vec![h / oh, w / ow];
            Ok(Some(vec![retarget(
                node,
                aten::AVG_POOL2D,
                vec![
                    Arg::Value(x),
                    Arg::Ints(kernel.clone()),
                    Arg::Ints(kernel),
                    Arg::Ints(vec![0, 0]),
                    Arg::Bool(false),
                    Arg::Bool(true),
                    Arg::None,
                ],
            )]))
        })
    }
}

unit_pass!(
    /// Padding counted in the average becomes an explicit `constant_pad_nd`;
    /// a stride left empty takes the kernel size.
    DecomposeAvgPool2d
);

impl GraphPass for DecomposeAvgPool2d {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::AVG_POOL2D], |graph, node| {
            if node.arg(6).is_some_and(|a| !a.is_none()) {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    "divisor_override is not supported",
                ));
            }
            let x = value_arg(Self::NAME, node, 0)?;
            let kernel = ints_arg(Self::NAME, node, 1)?;
            let stride = node.ints_arg(2).map(<[i64]>::to_vec).unwrap_or_default();
            let padding = node
                .ints_arg(3)
                .map(<[i64]>::to_vec)
                .unwrap_or_else(|| vec![0, 0]);
            let count_include_pad = node.bool_arg(5).unwrap_or(true);
            let padded = padding.iter().any(|&p| p != 0) && count_include_pad;
            if !stride.is_empty() && !padded {
                return Ok(None);
            }
            let stride = if stride.is_empty() { kernel.clone() } else { stride };

            let mut nodes = Vec::new();
            let mut input = x;
            let mut args = node.args.clone();
            args.resize(7, Arg::None);
            if padded {
                let (ph, pw) = (padding[0], padding.get(1).copied().unwrap_or(padding[0]));
                let mut shape = graph.shape(x).to_vec();
                let rank = shape.len();
                shape[rank - 2] += 2 * ph as usize;
                shape[rank - 1] += 2 * pw as usize;
                let fill = match node.input_qparams(0) {
                    Some(params) => Arg::Int(params.zp_per_tensor()?),
                    None => Arg::Float(0.0),
                };
                let pad = graph.create_node(
                    &format!("{}_pad", node.name),
                    aten::CONSTANT_PAD_ND,
                    vec![Arg::Value(x), Arg::Ints(vec![pw, pw, ph, ph]), fill],
                    shape,
                    graph.dtype(x),
                );
                input = pad.output();
                nodes.push(pad);
                args[3] = Arg::Ints(vec![0, 0]);
            }
            args[0] = Arg::Value(input);
            args[2] = Arg::Ints(stride);
            nodes.push(retarget(node, aten::AVG_POOL2D, args));
            Ok(Some(nodes))
        })
    }
}
