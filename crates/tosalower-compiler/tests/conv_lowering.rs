//! Convolution lowering through the whole compiler.

use tosalower_compiler::{
    compile, lower_to_tosa, CompilationConfig, LoweringContext, LoweringError, VisitorRegistry,
};
use tosalower_ir::ops::aten;
use tosalower_ir::{
    Arg, Attribute, DType, ExportedProgram, Graph, StateDict, TensorData, TosaOp, ValueKind,
};

struct Conv {
    input: [usize; 4],
    weight: [usize; 4],
    output: [usize; 4],
    stride: i64,
    pad: i64,
    groups: i64,
}

fn program(conv: &Conv) -> ExportedProgram {
    let mut graph = Graph::new();
    let mut state = StateDict::new();
    let x = graph.add_input("x", conv.input.to_vec(), DType::Float32);
    let w = graph.add_placeholder("w", conv.weight.to_vec(), DType::Float32, ValueKind::Parameter);
    let out_channels = conv.weight[0];
    let b = graph.add_placeholder("b", vec![out_channels], DType::Float32, ValueKind::Parameter);
    let count: usize = conv.weight.iter().product();
    let weights = (0..count).map(|i| i as f64 / count as f64).collect();
    state.insert(
        "w".into(),
        TensorData::from_f64(DType::Float32, conv.weight.to_vec(), weights).unwrap(),
    );
    state.insert("b".into(), TensorData::full(DType::Float32, vec![out_channels], 0.5));

    let node = graph.create_node(
        "conv",
        aten::CONVOLUTION,
        vec![
            Arg::Value(x),
            Arg::Value(w),
            Arg::Value(b),
            Arg::Ints(vec![conv.stride, conv.stride]),
            Arg::Ints(vec![conv.pad, conv.pad]),
            Arg::Ints(vec![1, 1]),
            Arg::Bool(false),
            Arg::Ints(vec![0, 0]),
            Arg::Int(conv.groups),
        ],
        conv.output.to_vec(),
        DType::Float32,
    );
    let y = node.output();
    graph.push_node(node);
    graph.add_output(y);
    ExportedProgram::new(graph, state)
}

fn config(spec: &str) -> CompilationConfig {
    CompilationConfig::new(spec.parse().unwrap())
}

#[test]
fn test_depthwise_conv_lowers_to_depthwise_operator() {
    let conv = Conv {
        input: [1, 4, 8, 8],
        weight: [8, 1, 3, 3],
        output: [1, 8, 6, 6],
        stride: 1,
        pad: 0,
        groups: 4,
    };
    let tosa = compile(program(&conv), &config("TOSA-1.0+FP")).unwrap();
    assert_eq!(tosa.count(TosaOp::DepthwiseConv2d), 1);
    assert_eq!(tosa.count(TosaOp::Conv2d), 0);

    let op = tosa.operators_of(TosaOp::DepthwiseConv2d).next().unwrap();
    let weight = tosa.tensor(&op.inputs[1]).unwrap();
    assert_eq!(weight.shape, vec![3, 3, 4, 2]);
}

#[test]
fn test_single_group_conv_is_not_depthwise() {
    let conv = Conv {
        input: [1, 1, 6, 6],
        weight: [4, 1, 3, 3],
        output: [1, 4, 4, 4],
        stride: 1,
        pad: 0,
        groups: 1,
    };
    let tosa = compile(program(&conv), &config("TOSA-0.80+MI")).unwrap();
    assert_eq!(tosa.count(TosaOp::Conv2d), 1);
    assert_eq!(tosa.count(TosaOp::DepthwiseConv2d), 0);
}

#[test]
fn test_size_adjustment_slices_input_before_conv() {
    // (8 + 0 - 2 - 1) % 2 = 1 trailing element the zero padding cannot absorb
    let conv = Conv {
        input: [1, 2, 8, 8],
        weight: [2, 2, 3, 3],
        output: [1, 2, 3, 3],
        stride: 2,
        pad: 0,
        groups: 1,
    };
    let tosa = compile(program(&conv), &config("TOSA-1.0+FP")).unwrap();
    assert!(tosa.count(TosaOp::Slice) >= 1);
    let op = tosa.operators_of(TosaOp::Conv2d).next().unwrap();
    match &op.attribute {
        Attribute::Conv { pad, .. } => assert_eq!(pad, &vec![0, 0, 0, 0]),
        other => panic!("unexpected attribute {other:?}"),
    }
}

#[test]
fn test_unadjusted_input_is_rejected_by_visitor() {
    let conv = Conv {
        input: [1, 2, 8, 8],
        weight: [2, 2, 3, 3],
        output: [1, 2, 3, 3],
        stride: 2,
        pad: 0,
        groups: 1,
    };
    let registry = VisitorRegistry::with_builtin_visitors().unwrap();
    let _guard = LoweringContext::enter("TOSA-1.0+FP".parse().unwrap());
    match lower_to_tosa(&program(&conv), &registry) {
        Err(LoweringError::InvalidPadding {
            node,
            input_size,
            remainder,
            ..
        }) => {
            assert_eq!(node, "conv");
            assert_eq!(input_size, 8);
            assert_eq!(remainder, 1);
        }
        other => panic!("unexpected result {:?}", other.map(|p| p.operators.len())),
    }
}
