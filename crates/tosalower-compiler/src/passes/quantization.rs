//! Folding of quantize/dequantize pairs into node annotations.
//!
//! The quantizer brackets every quantized operator with `dequantize` on its
//! inputs and `quantize` on its output. The passes here remove those
//! brackets and record the parameters on the operator instead:
//!
//! 1. [`FuseQuantizedActivationPass`] drops activations already implied by
//!    the clamping of the following quantize.
//! 2. [`QuantizeOperatorArguments`] moves scalar arguments into the
//!    quantized domain.
//! 3. [`FoldAndAnnotateQParamsPass`] folds the brackets into
//!    `meta.input_qparams` / `meta.output_qparams`.
//! 4. [`RetraceFoldedDtypesPass`] propagates the integer types.
//! 5. [`InsertRescalePass`] and [`InsertTableOpsPass`] lower what remains.
//!
//! Input slots of an annotation count tensor inputs in argument order, so a
//! convolution's weight is slot 1 and its bias slot 2.

use tosalower_ir::ops::{aten, quantized, tosa};
use tosalower_ir::program::{add_constant, lookup};
use tosalower_ir::{
    Arg, DType, Graph, Node, NumericProfile, QuantArgs, StateDict, TensorData, ValueId,
};

use super::util::{dequantize_producer, retarget, rewrite_each, DATA_MOVEMENT};
use super::{GraphPass, ProgramPass};
use crate::context::LoweringContext;
use crate::error::{LoweringError, Result};

/// Parameters carried by a quantize or dequantize node.
pub(crate) fn qparams_of(node: &Node) -> Option<QuantArgs> {
    if node.is(quantized::QUANTIZE_PER_TENSOR) || node.is(quantized::DEQUANTIZE_PER_TENSOR) {
        return Some(QuantArgs::per_tensor(
            node.float_arg(1)?,
            node.int_arg(2)?,
            node.int_arg(3)?,
            node.int_arg(4)?,
            node.dtype_arg(5)?,
        ));
    }
    if node.is(quantized::QUANTIZE_PER_CHANNEL) || node.is(quantized::DEQUANTIZE_PER_CHANNEL) {
        return QuantArgs::per_channel(
            node.arg(1)?.as_floats()?.to_vec(),
            node.arg(2)?.as_ints()?.to_vec(),
            node.int_arg(3)?.max(0) as usize,
            node.int_arg(4)?,
            node.int_arg(5)?,
            node.dtype_arg(6)?,
        )
        .ok();
    }
    None
}

fn is_boundary(node: &Node) -> bool {
    quantized::is_quantize(&node.target) || quantized::is_dequantize(&node.target)
}

/// Quantize every element of `data`, channel-wise along `params.axis`.
pub(crate) fn quantize_data(data: &TensorData, params: &QuantArgs) -> Result<TensorData> {
    let (inner, extent) = match params.axis {
        Some(axis) if axis < data.shape.len() => (
            data.shape[axis + 1..].iter().product::<usize>().max(1),
            data.shape[axis],
        ),
        _ => (1, 1),
    };
    let values = data
        .to_f64_vec()
        .into_iter()
        .enumerate()
        .map(|(i, v)| params.quantize_channel(v, (i / inner) % extent.max(1)))
        .collect();
    Ok(TensorData::from_i64(params.dtype, data.shape.clone(), values)?)
}

/// Common per-tensor parameters of the quantize nodes at `users`, if every
/// user is one and they agree.
fn common_quantize(graph: &Graph, users: &[usize]) -> Option<QuantArgs> {
    let mut common: Option<QuantArgs> = None;
    for &u in users {
        let node = &graph.nodes[u];
        if !node.is(quantized::QUANTIZE_PER_TENSOR) {
            return None;
        }
        let params = qparams_of(node)?;
        match &common {
            Some(c) if *c != params => return None,
            Some(_) => {}
            None => common = Some(params),
        }
    }
    common
}

/// Remove the quantize nodes at `users`, redirecting their outputs to `to`.
fn bypass_quantize_users(graph: &mut Graph, mut users: Vec<usize>, to: ValueId) {
    users.sort_unstable();
    for &u in users.iter().rev() {
        let q_out = graph.nodes[u].output();
        graph.replace_all_uses(q_out, to);
        graph.remove_node(u);
    }
}

unit_pass!(
    /// Removes `relu` (or `hardtanh` from zero) between a convolution, linear
    /// or add and a quantize whose zero point is its lower bound: the
    /// quantize clamps to the same range.
    FuseQuantizedActivationPass
);

impl FuseQuantizedActivationPass {
    fn is_fuseable_activation(graph: &Graph, node: &Node) -> bool {
        let implied = node.is(aten::RELU)
            || (node.is(aten::HARDTANH) && node.float_arg(1).is_some_and(|min| min == 0.0));
        if !implied {
            return false;
        }
        match graph.users(node.output()).as_slice() {
            [only] => {
                let q = &graph.nodes[*only];
                q.is(quantized::QUANTIZE_PER_TENSOR) && q.int_arg(2) == q.int_arg(3)
            }
            _ => false,
        }
    }

    fn is_fuseable_input(graph: &Graph, value: ValueId) -> bool {
        graph.producer_node(value).is_some_and(|p| {
            [aten::CONVOLUTION, aten::LINEAR, aten::ADD].contains(&p.target.as_str())
        }) && graph.users(value).len() == 1
    }
}

impl GraphPass for FuseQuantizedActivationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            let node = &graph.nodes[i];
            let fuse = node.value_arg(0).filter(|&input| {
                Self::is_fuseable_activation(graph, node) && Self::is_fuseable_input(graph, input)
            });
            match fuse {
                Some(input) => {
                    let out = node.output();
                    tracing::debug!(node = %node.name, "fusing activation into quantize");
                    graph.replace_all_uses(out, input);
                    graph.remove_node(i);
                    changed = true;
                }
                None => i += 1,
            }
        }
        Ok(changed)
    }
}

unit_pass!(
    /// Quantizes the bounds of a `clamp` whose result feeds a quantize so the
    /// clamp can run on integers after folding.
    QuantizeOperatorArguments
);

impl GraphPass for QuantizeOperatorArguments {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for i in 0..graph.nodes.len() {
            if !graph.nodes[i].is(aten::CLAMP) {
                continue;
            }
            let users = graph.users(graph.nodes[i].output());
            let Some(params) = common_quantize(graph, &users) else {
                continue;
            };
            let node = &mut graph.nodes[i];
            if node.args.iter().skip(1).any(|a| matches!(a, Arg::Int(_))) {
                continue;
            }
            node.args.resize(3, Arg::None);
            let min = match node.float_arg(1) {
                Some(v) => params.quantize(v)?,
                None => params.qmin,
            };
            let max = match node.float_arg(2) {
                Some(v) => params.quantize(v)?,
                None => params.qmax,
            };
            node.args[1] = Arg::Int(min);
            node.args[2] = Arg::Int(max);
            changed = true;
        }
        Ok(changed)
    }
}

unit_pass!(
    /// Folds quantize/dequantize brackets into node annotations.
    ///
    /// - `quantize(static)` becomes a quantized constant.
    /// - A `full` consumed only by quantize nodes is filled with the
    ///   quantized value directly.
    /// - On integer targets the quantize of a graph input and the dequantize
    ///   of a graph output are folded into the graph signature.
    /// - A dequantized input is annotated on its consumer, which then reads
    ///   the quantized value.
    /// - An output consumed only by equal quantize nodes is annotated and
    ///   takes their integer type.
    /// - A float bias of a quantized convolution becomes an int32 constant
    ///   at scale `input_scale * weight_scale`.
    FoldAndAnnotateQParamsPass
);

impl FoldAndAnnotateQParamsPass {
    fn fold_static_quantize(graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            let node = &graph.nodes[i];
            let data = node
                .value_arg(0)
                .filter(|_| quantized::is_quantize(&node.target))
                .and_then(|x| lookup(graph, state, x));
            let (Some(data), Some(params)) = (data, qparams_of(node)) else {
                i += 1;
                continue;
            };
            let folded = quantize_data(data, &params)?;
            let hint = format!("{}_folded", node.name);
            let out = node.output();
            let constant = add_constant(graph, state, &hint, folded);
            graph.replace_all_uses(out, constant);
            graph.remove_node(i);
            changed = true;
        }
        Ok(changed)
    }

    fn fold_quantized_full(graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            i += 1;
            if !graph.nodes[i - 1].is(aten::FULL) {
                continue;
            }
            let out = graph.nodes[i - 1].output();
            let users = graph.users(out);
            if users.is_empty() || graph.is_output(out) {
                continue;
            }
            let Some(params) = common_quantize(graph, &users) else {
                continue;
            };
            let node = &mut graph.nodes[i - 1];
            let fill = node.float_arg(1).unwrap_or(0.0);
            node.args.resize(3, Arg::None);
            node.args[1] = Arg::Int(params.quantize(fill)?);
            node.args[2] = Arg::DType(params.dtype);
            graph.value_mut(out).dtype = params.dtype;
            bypass_quantize_users(graph, users, out);
            changed = true;
        }
        Ok(changed)
    }

    fn fold_boundary(graph: &mut Graph) -> bool {
        let mut changed = false;
        for input in graph.inputs.clone() {
            let users = graph.users(input);
            if users.is_empty() || !graph.dtype(input).is_float() {
                continue;
            }
            let Some(params) = common_quantize(graph, &users) else {
                continue;
            };
            graph.value_mut(input).dtype = params.dtype;
            bypass_quantize_users(graph, users, input);
            changed = true;
        }
        for slot in 0..graph.outputs.len() {
            let source = graph
                .producer_node(graph.outputs[slot])
                .filter(|n| n.is(quantized::DEQUANTIZE_PER_TENSOR))
                .and_then(|n| n.value_arg(0));
            if let Some(source) = source {
                graph.outputs[slot] = source;
                changed = true;
            }
        }
        changed
    }

    fn annotate_inputs(graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for i in 0..graph.nodes.len() {
            if is_boundary(&graph.nodes[i]) {
                continue;
            }
            let folds: Vec<(usize, ValueId, ValueId, QuantArgs)> = graph.nodes[i]
                .inputs()
                .enumerate()
                .filter_map(|(slot, v)| {
                    let dq = dequantize_producer(graph, v)?;
                    Some((slot, v, dq.value_arg(0)?, qparams_of(dq)?))
                })
                .collect();
            let node = &mut graph.nodes[i];
            for (slot, from, to, params) in folds {
                node.annotate_input(slot, params)?;
                node.replace_input(from, to);
                changed = true;
            }
        }
        Ok(changed)
    }

    fn annotate_outputs(graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < graph.nodes.len() {
            let node = &graph.nodes[i];
            i += 1;
            if is_boundary(node) || node.outputs.len() != 1 {
                continue;
            }
            let out = node.output();
            let users = graph.users(out);
            if users.is_empty() || graph.is_output(out) {
                continue;
            }
            let Some(params) = common_quantize(graph, &users) else {
                continue;
            };
            graph.value_mut(out).dtype = params.dtype;
            graph.nodes[i - 1].annotate_output(0, params)?;
            bypass_quantize_users(graph, users, out);
            changed = true;
        }
        Ok(changed)
    }

    fn quantize_static_bias(graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        for i in 0..graph.nodes.len() {
            let node = &graph.nodes[i];
            if !(node.is(aten::CONVOLUTION) || node.is(aten::LINEAR))
                || node.input_qparams(2).is_some()
            {
                continue;
            }
            let (Some(input), Some(weight), Some(bias)) =
                (node.input_qparams(0), node.input_qparams(1), node.value_arg(2))
            else {
                continue;
            };
            let Some(data) = lookup(graph, state, bias).filter(|d| d.dtype.is_float()) else {
                continue;
            };
            let input_scale = input.scale_per_tensor()?;
            let scales: Vec<f64> = weight.scales.iter().map(|s| s * input_scale).collect();
            let (lo, hi) = (i32::MIN as i64, i32::MAX as i64);
            let params = if weight.is_per_channel() {
                let zeros = vec![0; scales.len()];
                QuantArgs::per_channel(scales, zeros, 0, lo, hi, DType::Int32)?
            } else {
                QuantArgs::per_tensor(scales[0], 0, lo, hi, DType::Int32)
            };
            let folded = quantize_data(data, &params)?;
            let hint = format!("{}_bias", node.name);
            let constant = add_constant(graph, state, &hint, folded);
            let node = &mut graph.nodes[i];
            node.replace_input(bias, constant);
            node.annotate_input(2, params)?;
            changed = true;
        }
        Ok(changed)
    }
}

impl ProgramPass for FoldAndAnnotateQParamsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = Self::fold_static_quantize(graph, state)?;
        changed |= Self::fold_quantized_full(graph)?;
        let integer_target = LoweringContext::current()
            .is_some_and(|spec| spec.numeric_profile() == NumericProfile::IntegerQuantized);
        if integer_target {
            changed |= Self::fold_boundary(graph);
        }
        changed |= Self::annotate_inputs(graph)?;
        changed |= Self::annotate_outputs(graph)?;
        changed |= Self::quantize_static_bias(graph, state)?;
        Ok(changed)
    }
}

unit_pass!(
    /// Re-derives output types after folding: annotated outputs take the
    /// quantized type, data movement follows its first input.
    RetraceFoldedDtypesPass
);

impl GraphPass for RetraceFoldedDtypesPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for i in 0..graph.nodes.len() {
            let node = &graph.nodes[i];
            let dtype = match node.output_qparams(0) {
                Some(params) => Some(params.dtype),
                None if DATA_MOVEMENT.contains(&node.target.as_str()) => {
                    node.inputs().next().map(|v| graph.dtype(v))
                }
                None => None,
            };
            let Some(dtype) = dtype else {
                continue;
            };
            for out in graph.nodes[i].outputs.clone() {
                if graph.dtype(out) != dtype {
                    graph.value_mut(out).dtype = dtype;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

unit_pass!(
    /// `quantize(dequantize(x))` with different parameters becomes a single
    /// `tosa._rescale`.
    InsertRescalePass
);

impl GraphPass for InsertRescalePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[quantized::QUANTIZE_PER_TENSOR], |graph, node| {
            let Some(q) = qparams_of(node) else {
                return Err(LoweringError::legalization(
                    Self::NAME,
                    &node.name,
                    "malformed quantize arguments",
                ));
            };
            let Some(dq_node) = node
                .value_arg(0)
                .and_then(|x| dequantize_producer(graph, x))
                .filter(|d| d.is(quantized::DEQUANTIZE_PER_TENSOR))
            else {
                return Ok(None);
            };
            let (Some(source), Some(dq)) = (dq_node.value_arg(0), qparams_of(dq_node)) else {
                return Ok(None);
            };
            let scale = dq.scale_per_tensor()? / q.scale_per_tensor()?;
            Ok(Some(vec![retarget(
                node,
                tosa::RESCALE,
                vec![
                    Arg::Value(source),
                    Arg::DType(q.dtype),
                    Arg::Floats(vec![scale]),
                    Arg::Int(dq.zp_per_tensor()?),
                    Arg::Int(q.zp_per_tensor()?),
                ],
            )]))
        })
    }
}

/// Operators computed through a 256-entry lookup table on int8 data.
const TABLE_OPS: &[&str] = &[
    aten::EXP,
    aten::LOG,
    aten::RECIPROCAL,
    aten::RSQRT,
    aten::SIGMOID,
    aten::TANH,
    aten::ERF,
    aten::FLOOR,
    aten::CEIL,
    aten::POW_SCALAR,
];

fn table_function(node: &Node) -> Option<Box<dyn Fn(f64) -> f64>> {
    let f: Box<dyn Fn(f64) -> f64> = match node.target.as_str() {
        aten::EXP => Box::new(f64::exp),
        aten::LOG => Box::new(f64::ln),
        aten::RECIPROCAL => Box::new(f64::recip),
        aten::RSQRT => Box::new(|x: f64| x.sqrt().recip()),
        aten::SIGMOID => Box::new(|x: f64| 1.0 / (1.0 + (-x).exp())),
        aten::TANH => Box::new(f64::tanh),
        aten::ERF => Box::new(libm::erf),
        aten::FLOOR => Box::new(f64::floor),
        aten::CEIL => Box::new(f64::ceil),
        aten::POW_SCALAR => {
            let exponent = node.float_arg(1)?;
            Box::new(move |x: f64| x.powf(exponent))
        }
        _ => return None,
    };
    Some(f)
}

/// Values of `f` over every int8 input, requantized to the output parameters.
pub(crate) fn build_table(
    input: &QuantArgs,
    output: &QuantArgs,
    f: impl Fn(f64) -> f64,
) -> Result<Vec<i64>> {
    let lo = output.dequantize(output.qmin)?;
    let hi = output.dequantize(output.qmax)?;
    (-128..=127)
        .map(|q| {
            let y = f(input.dequantize(q)?);
            let y = if y.is_nan() { 0.0 } else { y.clamp(lo, hi) };
            Ok(output.quantize(y)?)
        })
        .collect()
}

unit_pass!(
    /// Int8 unary operators become `tosa._table` over a precomputed table.
    InsertTableOpsPass
);

impl ProgramPass for InsertTableOpsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph, state: &mut StateDict) -> Result<bool> {
        let mut changed = false;
        for i in 0..graph.nodes.len() {
            let node = &graph.nodes[i];
            if !TABLE_OPS.contains(&node.target.as_str()) {
                continue;
            }
            let (Some(input), Some(output), Some(x)) =
                (node.input_qparams(0), node.output_qparams(0), node.value_arg(0))
            else {
                continue;
            };
            if graph.dtype(x) != DType::Int8 {
                continue;
            }
            let Some(f) = table_function(node) else {
                continue;
            };
            let values = build_table(input, output, f)?;
            let table = TensorData::from_i64(DType::Int8, vec![256], values)?;
            let hint = format!("{}_table", node.name);
            let mut replacement = retarget(node, tosa::TABLE, vec![Arg::Value(x)]);
            let table = add_constant(graph, state, &hint, table);
            replacement.args.push(Arg::Value(table));
            graph.nodes[i] = replacement;
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tosalower_ir::ValueKind;

    fn quantize(g: &mut Graph, x: ValueId, params: &QuantArgs) -> ValueId {
        let shape = g.shape(x).to_vec();
        let node = g.create_node(
            "q",
            quantized::QUANTIZE_PER_TENSOR,
            vec![
                Arg::Value(x),
                Arg::Float(params.scales[0]),
                Arg::Int(params.zero_points[0]),
                Arg::Int(params.qmin),
                Arg::Int(params.qmax),
                Arg::DType(params.dtype),
            ],
            shape,
            params.dtype,
        );
        let out = node.output();
        g.push_node(node);
        out
    }

    fn dequantize(g: &mut Graph, x: ValueId, params: &QuantArgs) -> ValueId {
        let shape = g.shape(x).to_vec();
        let node = g.create_node(
            "dq",
            quantized::DEQUANTIZE_PER_TENSOR,
            vec![
                Arg::Value(x),
                Arg::Float(params.scales[0]),
                Arg::Int(params.zero_points[0]),
                Arg::Int(params.qmin),
                Arg::Int(params.qmax),
                Arg::DType(params.dtype),
            ],
            shape,
            DType::Float32,
        );
        let out = node.output();
        g.push_node(node);
        out
    }

    /// `x -> q -> dq -> abs -> q -> dq -> out`
    fn bracketed_abs() -> Graph {
        let params = QuantArgs::int8(0.1, 0);
        let mut g = Graph::new();
        let x = g.add_input("x", vec![4], DType::Float32);
        let q = quantize(&mut g, x, &params);
        let dq = dequantize(&mut g, q, &params);
        let abs = g.create_node("abs", aten::ABS, vec![Arg::Value(dq)], vec![4], DType::Float32);
        let abs_out = abs.output();
        g.push_node(abs);
        let q2 = quantize(&mut g, abs_out, &QuantArgs::int8(0.05, 0));
        let out = dequantize(&mut g, q2, &QuantArgs::int8(0.05, 0));
        g.add_output(out);
        g
    }

    #[test]
    fn test_annotation_on_float_target_keeps_boundary() {
        let mut g = bracketed_abs();
        let mut state = StateDict::new();
        let _ctx = LoweringContext::enter("TOSA-1.0+FP".parse().unwrap());
        assert!(FoldAndAnnotateQParamsPass.call(&mut g, &mut state).unwrap());
        g.eliminate_dead_code();
        g.validate().unwrap();

        let abs = g.nodes.iter().find(|n| n.is(aten::ABS)).unwrap();
        assert_eq!(abs.input_qparams(0).unwrap().scales, vec![0.1]);
        assert_eq!(abs.output_qparams(0).unwrap().scales, vec![0.05]);
        assert_eq!(g.dtype(abs.output()), DType::Int8);
        let targets: Vec<&str> = g.nodes.iter().map(|n| n.target.as_str()).collect();
        assert_eq!(
            targets,
            vec![quantized::QUANTIZE_PER_TENSOR, aten::ABS, quantized::DEQUANTIZE_PER_TENSOR]
        );
    }

    #[test]
    fn test_annotation_on_integer_target_folds_boundary() {
        let mut g = bracketed_abs();
        let mut state = StateDict::new();
        let _ctx = LoweringContext::enter("TOSA-0.80+BI".parse().unwrap());
        FoldAndAnnotateQParamsPass.call(&mut g, &mut state).unwrap();
        g.eliminate_dead_code();
        g.validate().unwrap();

        assert_eq!(g.nodes.len(), 1);
        assert!(g.nodes[0].is(aten::ABS));
        assert_eq!(g.dtype(g.inputs[0]), DType::Int8);
        assert_eq!(g.outputs, g.nodes[0].outputs);
    }

    #[test]
    fn test_static_quantize_is_folded() {
        let params = QuantArgs::int8(0.5, 0);
        let mut g = Graph::new();
        let w = g.add_placeholder("w", vec![3], DType::Float32, ValueKind::Parameter);
        let q = quantize(&mut g, w, &params);
        let dq = dequantize(&mut g, q, &params);
        g.add_output(dq);
        let mut state = StateDict::new();
        state.insert(
            "w".into(),
            TensorData::from_f64(DType::Float32, vec![3], vec![1.0, -0.5, 100.0]).unwrap(),
        );

        assert!(FoldAndAnnotateQParamsPass.call(&mut g, &mut state).unwrap());
        let folded = g.nodes[0].value_arg(0).unwrap();
        let data = lookup(&g, &state, folded).unwrap();
        assert_eq!(data.dtype, DType::Int8);
        assert_eq!(data.to_i64_vec(), vec![2, -1, 127]);
    }

    #[test]
    fn test_rescale_inserted_for_requantize() {
        let a = QuantArgs::int8(0.2, 3);
        let b = QuantArgs::int8(0.1, -1);
        let mut g = Graph::new();
        let x = g.add_input("x", vec![2], DType::Int8);
        let dq = dequantize(&mut g, x, &a);
        let q = quantize(&mut g, dq, &b);
        g.add_output(q);

        assert!(InsertRescalePass.call(&mut g).unwrap());
        g.eliminate_dead_code();
        let rescale = &g.nodes[0];
        assert!(rescale.is(tosa::RESCALE));
        assert_eq!(rescale.value_arg(0), Some(x));
        approx::assert_relative_eq!(rescale.arg(2).unwrap().as_floats().unwrap()[0], 2.0);
        assert_eq!(rescale.int_arg(3), Some(3));
        assert_eq!(rescale.int_arg(4), Some(-1));
    }

    #[test]
    fn test_relu_fused_into_quantize() {
        let mut g = Graph::new();
        let a = g.add_input("a", vec![4], DType::Float32);
        let b = g.add_input("b", vec![4], DType::Float32);
        let add = g.create_node(
            "add",
            aten::ADD,
            vec![Arg::Value(a), Arg::Value(b)],
            vec![4],
            DType::Float32,
        );
        let add_out = add.output();
        g.push_node(add);
        let relu = g.create_node(
            "relu",
            aten::RELU,
            vec![Arg::Value(add_out)],
            vec![4],
            DType::Float32,
        );
        let relu_out = relu.output();
        g.push_node(relu);
        let q = quantize(&mut g, relu_out, &QuantArgs::int8(0.1, -128));
        g.add_output(q);

        assert!(FuseQuantizedActivationPass.call(&mut g).unwrap());
        assert!(g.nodes.iter().all(|n| !n.is(aten::RELU)));
        assert_eq!(g.nodes[1].value_arg(0), Some(add_out));

        let mut g2 = bracketed_abs();
        assert!(!FuseQuantizedActivationPass.call(&mut g2).unwrap());
    }

    #[test]
    fn test_sigmoid_table() {
        let input = QuantArgs::int8(0.1, 0);
        let output = QuantArgs::int8(1.0 / 256.0, -128);
        let table = build_table(&input, &output, |x| 1.0 / (1.0 + (-x).exp())).unwrap();
        assert_eq!(table.len(), 256);
        assert_eq!(table[128], 0);
        assert!(table.windows(2).all(|w| w[0] <= w[1]));
        assert!(table.iter().all(|&v| (-128..=127).contains(&v)));
    }

    #[test]
    fn test_clamp_bounds_quantized() {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![4], DType::Float32);
        let clamp = g.create_node(
            "clamp",
            aten::CLAMP,
            vec![Arg::Value(x), Arg::Float(0.0), Arg::Float(6.0)],
            vec![4],
            DType::Float32,
        );
        let out = clamp.output();
        g.push_node(clamp);
        let q = quantize(&mut g, out, &QuantArgs::int8(0.05, -128));
        g.add_output(q);

        assert!(QuantizeOperatorArguments.call(&mut g).unwrap());
        assert_eq!(g.nodes[0].args[1], Arg::Int(-128));
        assert_eq!(g.nodes[0].args[2], Arg::Int(-8));
        assert!(!QuantizeOperatorArguments.call(&mut g).unwrap());
    }
}
