//! Activations and pointwise math built from simpler operators.

use tosalower_ir::ops::aten;
use tosalower_ir::{Arg, Graph, Node};

use super::super::util::{
    normalize_dim, reduced_shape, retarget, rewrite_each, value_arg, Decomposition,
};
use super::super::{GraphPass};
use crate::error::{LoweringError, Result};

unit_pass!(
    /// `gelu` in its exact (`erf`) or `tanh` approximated form.
    DecomposeGeluPass
);

impl GraphPass for DecomposeGeluPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::GELU], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let approximate = node.arg(1).and_then(Arg::as_str).unwrap_or("none");
            let mut d = Decomposition::new(graph, node);
            let gate = match approximate {
                "none" => {
                    let c = d.constant(x, std::f64::consts::FRAC_1_SQRT_2);
                    let scaled = d.binary(aten::MUL, x, c);
                    d.unary(aten::ERF, scaled)
                }
                "tanh" => {
                    let x2 = d.binary(aten::MUL, x, x);
                    let x3 = d.binary(aten::MUL, x2, x);
                    let k = d.constant(x, 0.044715);
                    let cubic = d.binary(aten::MUL, x3, k);
                    let inner = d.binary(aten::ADD, x, cubic);
                    let s = d.constant(x, (2.0 / std::f64::consts::PI).sqrt());
                    let scaled = d.binary(aten::MUL, inner, s);
                    d.unary(aten::TANH, scaled)
                }
                other => {
                    return Err(LoweringError::legalization(
                        Self::NAME,
                        &node.name,
                        format!("unknown approximation '{other}'"),
                    ))
                }
            };
            let one = d.constant(x, 1.0);
            let shifted = d.binary(aten::ADD, gate, one);
            let half = d.constant(x, 0.5);
            let half_x = d.binary(aten::MUL, x, half);
            d.binary(aten::MUL, half_x, shifted);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// `leaky_relu(x) = max(x, 0) + slope * min(x, 0)`.
    DecomposeLeakyReLUPass
);

impl GraphPass for DecomposeLeakyReLUPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::LEAKY_RELU], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let slope = node.float_arg(1).unwrap_or(0.01);
            let mut d = Decomposition::new(graph, node);
            let zero = d.constant(x, 0.0);
            let positive = d.binary(aten::MAXIMUM, x, zero);
            let negative = d.binary(aten::MINIMUM, x, zero);
            let s = d.constant(x, slope);
            let scaled = d.binary(aten::MUL, negative, s);
            d.binary(aten::ADD, positive, scaled);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// `silu(x) = x * sigmoid(x)`.
    DecomposeSiluPass
);

impl GraphPass for DecomposeSiluPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SILU], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let mut d = Decomposition::new(graph, node);
            let gate = d.unary(aten::SIGMOID, x);
            d.binary(aten::MUL, x, gate);
            Ok(d.finish(node))
        })
    }
}

fn softmax(
    pass: &'static str,
    graph: &mut Graph,
    node: &Node,
    stable: bool,
) -> Result<Option<Vec<Node>>> {
    let x = value_arg(pass, node, 0)?;
    let shape = graph.shape(x).to_vec();
    let dim = normalize_dim(pass, node, node.int_arg(1).unwrap_or(-1), shape.len())?;
    let dtype = graph.dtype(x);
    let mut d = Decomposition::new(graph, node);
    let shifted = if stable {
        let max = d.node(
            aten::AMAX,
            vec![Arg::Value(x), Arg::Ints(vec![dim as i64]), Arg::Bool(true)],
            reduced_shape(&shape, &[dim], true),
            dtype,
        );
        d.binary(aten::SUB, x, max)
    } else {
        x
    };
    let exp = d.unary(aten::EXP, shifted);
    let total = d.sum(exp, &[dim]);
    let inverse = d.unary(aten::RECIPROCAL, total);
    d.binary(aten::MUL, exp, inverse);
    Ok(d.finish(node))
}

unit_pass!(
    /// Numerically stable softmax: `exp(x - amax(x)) / sum(exp(x - amax(x)))`.
    DecomposeSoftmaxPass
);

impl GraphPass for DecomposeSoftmaxPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SOFTMAX], |graph, node| {
            softmax(Self::NAME, graph, node, true)
        })
    }
}

unit_pass!(
    /// Softmax without the max subtraction, for targets lacking `amax`.
    DecomposeSoftmaxUnstablePass
);

impl GraphPass for DecomposeSoftmaxUnstablePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SOFTMAX], |graph, node| {
            softmax(Self::NAME, graph, node, false)
        })
    }
}

unit_pass!(
    /// `sign(x)` as nested `where` over `x > 0` and `x < 0`.
    DecomposeSignPass
);

impl GraphPass for DecomposeSignPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SIGN], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let mut d = Decomposition::new(graph, node);
            let zero = d.constant(x, 0.0);
            let one = d.constant(x, 1.0);
            let minus_one = d.constant(x, -1.0);
            let positive = d.binary(aten::GT, x, zero);
            let negative = d.binary(aten::LT, x, zero);
            let lower = d.select(negative, minus_one, zero);
            d.select(positive, one, lower);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// `sinh(x) = (exp(x) - exp(-x)) / 2`.
    DecomposeSinhPass
);

impl GraphPass for DecomposeSinhPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SINH], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            let mut d = Decomposition::new(graph, node);
            let up = d.unary(aten::EXP, x);
            let negated = d.unary(aten::NEG, x);
            let down = d.unary(aten::EXP, negated);
            let diff = d.binary(aten::SUB, up, down);
            let half = d.constant(x, 0.5);
            d.binary(aten::MUL, diff, half);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// Round half away from zero: `x >= 0 ? floor(x + 0.5) : ceil(x - 0.5)`.
    DecomposeRoundPass
);

impl GraphPass for DecomposeRoundPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::ROUND], |graph, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            if !graph.dtype(x).is_float() {
                return Ok(None);
            }
            let mut d = Decomposition::new(graph, node);
            let zero = d.constant(x, 0.0);
            let half = d.constant(x, 0.5);
            let non_negative = d.binary(aten::GE, x, zero);
            let up = d.binary(aten::ADD, x, half);
            let floor = d.unary(aten::FLOOR, up);
            let down = d.binary(aten::SUB, x, half);
            let ceil = d.unary(aten::CEIL, down);
            d.select(non_negative, floor, ceil);
            Ok(d.finish(node))
        })
    }
}

unit_pass!(
    /// `sqrt(x) = pow(x, 0.5)`.
    DecomposeSqrtPass
);

impl GraphPass for DecomposeSqrtPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn call(&self, graph: &mut Graph) -> Result<bool> {
        rewrite_each(graph, &[aten::SQRT], |_, node| {
            let x = value_arg(Self::NAME, node, 0)?;
            Ok(Some(vec![retarget(
                node,
                aten::POW_SCALAR,
                vec![Arg::Value(x), Arg::Float(0.5)],
            )]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tosalower_ir::DType;

    fn unary_graph(target: &str, extra: Vec<Arg>) -> Graph {
        let mut g = Graph::new();
        let x = g.add_input("x", vec![2, 8], DType::Float32);
        let mut args = vec![Arg::Value(x)];
        args.extend(extra);
        let node = g.create_node("op", target, args, vec![2, 8], DType::Float32);
        let out = node.output();
        g.push_node(node);
        g.add_output(out);
        g
    }

    #[test]
    fn test_softmax_stable_uses_amax() {
        let mut g = unary_graph(aten::SOFTMAX, vec![Arg::Int(-1), Arg::Bool(false)]);
        assert!(DecomposeSoftmaxPass.call(&mut g).unwrap());
        g.validate().unwrap();
        let targets: Vec<&str> = g.nodes.iter().map(|n| n.target.as_str()).collect();
        assert_eq!(
            targets,
            vec![aten::AMAX, aten::SUB, aten::EXP, aten::SUM, aten::RECIPROCAL, aten::MUL]
        );
        assert_eq!(g.nodes.last().unwrap().name, "op");
    }

    #[test]
    fn test_softmax_unstable_has_no_amax() {
        let mut g = unary_graph(aten::SOFTMAX, vec![Arg::Int(1), Arg::Bool(false)]);
        assert!(DecomposeSoftmaxUnstablePass.call(&mut g).unwrap());
        assert!(g.nodes.iter().all(|n| !n.is(aten::AMAX)));
        assert_eq!(g.shape(g.nodes[1].output()), &[2, 1]);
    }

    #[test]
    fn test_gelu_rejects_unknown_approximation() {
        let mut g = unary_graph(aten::GELU, vec![Arg::Str("cubic".into())]);
        assert!(matches!(
            DecomposeGeluPass.call(&mut g),
            Err(LoweringError::Legalization { .. })
        ));
    }

    #[test]
    fn test_gelu_tanh() {
        let mut g = unary_graph(aten::GELU, vec![Arg::Str("tanh".into())]);
        assert!(DecomposeGeluPass.call(&mut g).unwrap());
        g.validate().unwrap();
        assert!(g.nodes.iter().any(|n| n.is(aten::TANH)));
        assert!(g.nodes.iter().all(|n| !n.is(aten::GELU)));
    }

    #[test]
    fn test_sign_and_round_validate() {
        let cases: [(&dyn GraphPass, &str); 4] = [
            (&DecomposeSignPass, aten::SIGN),
            (&DecomposeRoundPass, aten::ROUND),
            (&DecomposeSinhPass, aten::SINH),
            (&DecomposeLeakyReLUPass, aten::LEAKY_RELU),
        ];
        for (pass, target) in cases {
            let mut g = unary_graph(target, vec![]);
            assert!(pass.call(&mut g).unwrap(), "{}", pass.name());
            g.validate().unwrap();
            assert!(g.nodes.iter().all(|n| !n.is(target)));
        }
    }
}
