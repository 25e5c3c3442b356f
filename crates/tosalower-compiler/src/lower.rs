//! Emission of a legalized program as TOSA.
//!
//! After the backend pipeline every node has a visitor for the target. The
//! driver declares the program inputs and the static values, hands each node
//! to its visitor in graph order and finally marks the outputs. Program
//! inputs and outputs keep their logical layout; values with a `dim_order`
//! are transposed on the way in and out.

use std::collections::HashMap;

use tosalower_ir::{ExportedProgram, Node, TosaDType, TosaGraphBuilder, TosaProgram, ValueId};
use tracing::{debug, info, info_span};

use crate::config::CompilationConfig;
use crate::context::LoweringContext;
use crate::error::{LoweringError, Result};
use crate::passes::PassManager;
use crate::visitors::{emit_transpose, TensorArg, TosaArg, VisitorRegistry};

/// Emitted tensors of the values seen so far.
struct Emitter<'a> {
    program: &'a ExportedProgram,
    builder: TosaGraphBuilder,
    tensors: HashMap<ValueId, TensorArg>,
}

impl<'a> Emitter<'a> {
    fn value_arg(&self, node: &Node, id: ValueId) -> Result<TensorArg> {
        self.tensors.get(&id).cloned().ok_or_else(|| {
            LoweringError::invalid_argument(
                &node.name,
                format!("operand {id} has not been emitted"),
            )
        })
    }

    fn declare_inputs(&mut self) -> Result<()> {
        let graph = &self.program.graph;
        for &id in &graph.inputs {
            let value = graph.try_value(id)?;
            let dtype = TosaDType::from_dtype(value.dtype)?;
            self.builder.add_input(&value.name, &value.shape, dtype)?;
            let logical = TensorArg::new(value.name.clone(), value.shape.clone(), value.dtype);
            let arg = TensorArg::from_value(value.name.clone(), value);
            let arg = match arg.dim_order.clone() {
                Some(order) => {
                    let hint = format!("{}_dim_order", value.name);
                    let name = self.builder.add_intermediate(&hint, &arg.physical_shape(), dtype);
                    emit_transpose(&mut self.builder, &logical.name, &name, &order)?;
                    TensorArg { name, ..arg }
                }
                None => logical,
            };
            self.tensors.insert(id, arg);
        }
        Ok(())
    }

    /// Constants for every static value the graph still references, stored
    /// in their physical layout.
    fn declare_static_values(&mut self) -> Result<()> {
        let graph = &self.program.graph;
        for id in graph.used_static_values() {
            let value = graph.try_value(id)?;
            let data = self.program.data(id).ok_or_else(|| {
                LoweringError::invalid_argument(
                    &value.name,
                    "static value has no entry in the state dict",
                )
            })?;
            let arg = TensorArg::from_value(value.name.clone(), value);
            let data = match arg.dim_order.as_deref() {
                Some(order) => data.permute(order)?,
                None => data.clone(),
            };
            let dtype = TosaDType::from_dtype(value.dtype)?;
            let name = self.builder.add_const(&value.name, dtype, data);
            self.tensors.insert(id, TensorArg { name, ..arg });
        }
        Ok(())
    }

    fn resolve_args(&self, node: &Node) -> Result<Vec<TosaArg>> {
        node.args
            .iter()
            .map(|arg| match TosaArg::scalar(arg) {
                Some(scalar) => Ok(scalar),
                None => match (arg.as_value(), arg.as_values()) {
                    (Some(id), _) => Ok(TosaArg::Tensor(self.value_arg(node, id)?)),
                    (None, Some(ids)) => ids
                        .iter()
                        .map(|&id| self.value_arg(node, id))
                        .collect::<Result<Vec<_>>>()
                        .map(TosaArg::Tensors),
                    (None, None) => Err(LoweringError::invalid_argument(
                        &node.name,
                        "unsupported argument kind",
                    )),
                },
            })
            .collect()
    }

    fn visit(&mut self, node: &Node, registry: &VisitorRegistry) -> Result<()> {
        let visitor = registry.resolve(node, self.builder.spec())?;
        let &[id] = node.outputs.as_slice() else {
            return Err(LoweringError::invalid_argument(
                &node.name,
                format!("expected one output, found {}", node.outputs.len()),
            ));
        };
        let inputs = self.resolve_args(node)?;

        let value = self.program.graph.try_value(id)?;
        let dtype = TosaDType::from_dtype(value.dtype)?;
        let mut output = TensorArg::from_value(value.name.clone(), value);
        output.name = self
            .builder
            .add_intermediate(&value.name, &output.physical_shape(), dtype);

        debug!(node = %node.name, target = %node.target, output = %output.name, "visiting");
        visitor.define_node(node, &mut self.builder, &inputs, &output)?;
        self.tensors.insert(id, output);
        Ok(())
    }

    fn declare_outputs(&mut self) -> Result<()> {
        let graph = &self.program.graph;
        for &id in &graph.outputs {
            let value = graph.try_value(id)?;
            let arg = self.tensors.get(&id).cloned().ok_or_else(|| {
                LoweringError::invalid_argument(&value.name, "program output was never produced")
            })?;
            let name = match arg.inverse_order() {
                Some(inverse) => {
                    let hint = format!("{}_output", value.name);
                    let dtype = arg.tosa_dtype()?;
                    let name = self.builder.add_intermediate(&hint, &arg.shape, dtype);
                    emit_transpose(&mut self.builder, &arg.name, &name, &inverse)?;
                    name
                }
                None => arg.name,
            };
            self.builder.add_output(&name)?;
        }
        Ok(())
    }
}

/// Emit a program that has been through the backend pipeline for the active
/// target.
///
/// Fails with [`LoweringError::NoActiveSpecification`] outside a
/// [`LoweringContext`] and with [`LoweringError::NoVisitor`] for the first
/// node whose operator has no visitor on the target.
pub fn lower_to_tosa(program: &ExportedProgram, registry: &VisitorRegistry) -> Result<TosaProgram> {
    let spec = LoweringContext::require()?;
    let mut emitter = Emitter {
        program,
        builder: TosaGraphBuilder::new(spec),
        tensors: HashMap::new(),
    };
    emitter.declare_inputs()?;
    emitter.declare_static_values()?;
    for node in &program.graph.nodes {
        emitter.visit(node, registry)?;
    }
    emitter.declare_outputs()?;
    Ok(emitter.builder.finish())
}

/// Run the backend pipeline for `config.spec` and emit the result.
///
/// ```
/// use tosalower_compiler::{compile, CompilationConfig};
/// use tosalower_ir::{ops::aten, Arg, DType, ExportedProgram, Graph, TosaOp};
///
/// let mut graph = Graph::new();
/// let x = graph.add_input("x", vec![2, 3], DType::Float32);
/// let y = graph.add_input("y", vec![2, 3], DType::Float32);
/// let add = graph.create_node(
///     "add",
///     aten::ADD,
///     vec![Arg::Value(x), Arg::Value(y)],
///     vec![2, 3],
///     DType::Float32,
/// );
/// let out = add.output();
/// graph.push_node(add);
/// graph.add_output(out);
///
/// let config = CompilationConfig::new("TOSA-1.0+FP".parse().unwrap());
/// let tosa = compile(ExportedProgram::new(graph, Default::default()), &config).unwrap();
/// assert_eq!(tosa.count(TosaOp::Add), 1);
/// ```
pub fn compile(program: ExportedProgram, config: &CompilationConfig) -> Result<TosaProgram> {
    let registry = VisitorRegistry::with_builtin_visitors()?;
    compile_with_registry(program, config, &registry)
}

/// [`compile`] with a caller-provided visitor catalog.
pub fn compile_with_registry(
    program: ExportedProgram,
    config: &CompilationConfig,
    registry: &VisitorRegistry,
) -> Result<TosaProgram> {
    let _span = info_span!("compile", spec = %config.spec).entered();
    let manager = PassManager::with_config(config.clone());
    let program = manager.transform_to_backend_pipeline(program)?;

    let _context = LoweringContext::enter(config.spec.clone());
    let tosa = lower_to_tosa(&program, registry)?;
    info!(
        tensors = tosa.tensors.len(),
        operators = tosa.operators.len(),
        "emitted TOSA program"
    );
    Ok(tosa)
}
