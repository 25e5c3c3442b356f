//! Lowering performance benchmarks.
//!
//! Measures pipeline selection, backend pipelines and full compilation for
//! convolution stacks of increasing depth.
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tosalower_compiler::{compile, select_pipeline, CompilationConfig, PassManager};
use tosalower_ir::ops::aten;
use tosalower_ir::{
    Arg, DType, ExportedProgram, Graph, StateDict, TensorData, TosaSpecification, ValueKind,
};

// ============================================================================
// Fixtures
// ============================================================================

/// `depth` 3x3 convolutions with relu between them on a `[1, 8, 16, 16]` input.
fn conv_stack(depth: usize) -> ExportedProgram {
    let mut graph = Graph::new();
    let mut state = StateDict::new();
    let mut x = graph.add_input("x", vec![1, 8, 16, 16], DType::Float32);
    for layer in 0..depth {
        let w_name = format!("w{layer}");
        let b_name = format!("b{layer}");
        let w_shape = vec![8, 8, 3, 3];
        let w = graph.add_placeholder(&w_name, w_shape, DType::Float32, ValueKind::Parameter);
        let b = graph.add_placeholder(&b_name, vec![8], DType::Float32, ValueKind::Parameter);
        state.insert(w_name, TensorData::full(DType::Float32, vec![8, 8, 3, 3], 0.01));
        state.insert(b_name, TensorData::full(DType::Float32, vec![8], 0.0));

        let conv = graph.create_node(
            &format!("conv{layer}"),
            aten::CONVOLUTION,
            vec![
                Arg::Value(x),
                Arg::Value(w),
                Arg::Value(b),
                Arg::Ints(vec![1, 1]),
                Arg::Ints(vec![1, 1]),
                Arg::Ints(vec![1, 1]),
                Arg::Bool(false),
                Arg::Ints(vec![0, 0]),
                Arg::Int(1),
            ],
            vec![1, 8, 16, 16],
            DType::Float32,
        );
        let conv_out = conv.output();
        graph.push_node(conv);
        let relu = graph.create_node(
            &format!("relu{layer}"),
            aten::RELU,
            vec![Arg::Value(conv_out)],
            vec![1, 8, 16, 16],
            DType::Float32,
        );
        x = relu.output();
        graph.push_node(relu);
    }
    graph.add_output(x);
    ExportedProgram::new(graph, state)
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_pipeline_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_selection");

    for spec in ["TOSA-0.80+BI+u55", "TOSA-1.0+INT", "TOSA-1.0+FP"] {
        let spec: TosaSpecification = spec.parse().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(&spec), &spec, |b, spec| {
            b.iter(|| black_box(select_pipeline(black_box(spec)).unwrap()));
        });
    }

    group.finish();
}

fn bench_backend_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_pipeline");
    let manager = PassManager::new("TOSA-1.0+FP".parse().unwrap());

    for depth in [1, 4, 16] {
        let program = conv_stack(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &program, |b, program| {
            b.iter(|| {
                let legalized = manager.transform_to_backend_pipeline(program.clone()).unwrap();
                black_box(legalized);
            });
        });
    }

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let config = CompilationConfig::new("TOSA-1.0+FP".parse().unwrap());

    for depth in [1, 4, 16] {
        let program = conv_stack(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &program, |b, program| {
            b.iter(|| black_box(compile(program.clone(), &config).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pipeline_selection,
    bench_backend_pipeline,
    bench_compile
);
criterion_main!(benches);
