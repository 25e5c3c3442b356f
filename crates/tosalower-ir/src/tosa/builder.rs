//! Incremental construction of a [`TosaProgram`].

use std::collections::HashMap;

use super::{shape_to_i64, Attribute, TosaDType, TosaOp, TosaOperator, TosaProgram, TosaTensor};
use crate::error::IrError;
use crate::spec::TosaSpecification;
use crate::tensor::TensorData;

/// Collects tensors and operators for one compilation.
///
/// Operators may only reference tensors that were declared before them, so
/// the finished program is always in a valid emission order.
#[derive(Debug)]
pub struct TosaGraphBuilder {
    spec: TosaSpecification,
    tensors: Vec<TosaTensor>,
    index: HashMap<String, usize>,
    operators: Vec<TosaOperator>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl TosaGraphBuilder {
    pub fn new(spec: TosaSpecification) -> Self {
        TosaGraphBuilder {
            spec,
            tensors: Vec::new(),
            index: HashMap::new(),
            operators: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn spec(&self) -> &TosaSpecification {
        &self.spec
    }

    fn declare(&mut self, tensor: TosaTensor) -> Result<(), IrError> {
        if self.index.contains_key(&tensor.name) {
            return Err(IrError::DuplicateTosaTensor { name: tensor.name });
        }
        self.index.insert(tensor.name.clone(), self.tensors.len());
        self.tensors.push(tensor);
        Ok(())
    }

    fn unique_name(&self, hint: &str) -> String {
        if !self.index.contains_key(hint) {
            return hint.to_string();
        }
        (1..)
            .map(|i| format!("{hint}_{i}"))
            .find(|c| !self.index.contains_key(c))
            .unwrap_or_else(|| hint.to_string())
    }

    /// Declare a graph input.
    pub fn add_input(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: TosaDType,
    ) -> Result<(), IrError> {
        self.add_tensor(name, shape, dtype)?;
        self.inputs.push(name.to_string());
        Ok(())
    }

    /// Declare a tensor under an exact name.
    pub fn add_tensor(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: TosaDType,
    ) -> Result<(), IrError> {
        self.declare(TosaTensor {
            name: name.to_string(),
            shape: shape_to_i64(shape),
            dtype,
            data: None,
        })
    }

    /// Declare a tensor with a unique name derived from `hint` and return it.
    pub fn add_intermediate(&mut self, hint: &str, shape: &[usize], dtype: TosaDType) -> String {
        let name = self.unique_name(hint);
        self.index.insert(name.clone(), self.tensors.len());
        self.tensors.push(TosaTensor {
            name: name.clone(),
            shape: shape_to_i64(shape),
            dtype,
            data: None,
        });
        name
    }

    /// Declare a constant tensor with a unique name derived from `hint`.
    pub fn add_const(&mut self, hint: &str, dtype: TosaDType, data: TensorData) -> String {
        let name = self.unique_name(hint);
        self.index.insert(name.clone(), self.tensors.len());
        self.tensors.push(TosaTensor {
            name: name.clone(),
            shape: shape_to_i64(&data.shape),
            dtype,
            data: Some(data),
        });
        name
    }

    pub fn add_operator(
        &mut self,
        op: TosaOp,
        inputs: Vec<String>,
        outputs: Vec<String>,
        attribute: Attribute,
    ) -> Result<(), IrError> {
        for name in inputs.iter().chain(&outputs) {
            if !self.index.contains_key(name) {
                return Err(IrError::UnknownTosaTensor { name: name.clone() });
            }
        }
        self.operators.push(TosaOperator {
            op,
            inputs,
            outputs,
            attribute,
        });
        Ok(())
    }

    pub fn add_output(&mut self, name: &str) -> Result<(), IrError> {
        if !self.index.contains_key(name) {
            return Err(IrError::UnknownTosaTensor {
                name: name.to_string(),
            });
        }
        self.outputs.push(name.to_string());
        Ok(())
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn tensor(&self, name: &str) -> Option<&TosaTensor> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    pub fn operators(&self) -> &[TosaOperator] {
        &self.operators
    }

    pub fn finish(self) -> TosaProgram {
        TosaProgram {
            spec: self.spec,
            tensors: self.tensors,
            operators: self.operators,
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn builder() -> TosaGraphBuilder {
        TosaGraphBuilder::new("TOSA-1.0+FP".parse().unwrap())
    }

    #[test]
    fn test_operator_requires_declared_tensors() {
        let mut b = builder();
        b.add_input("x", &[2], TosaDType::Fp32).unwrap();
        let err = b
            .add_operator(TosaOp::Abs, vec!["x".into()], vec!["y".into()], Attribute::None)
            .unwrap_err();
        assert_eq!(err, IrError::UnknownTosaTensor { name: "y".into() });
        b.add_tensor("y", &[2], TosaDType::Fp32).unwrap();
        b.add_operator(TosaOp::Abs, vec!["x".into()], vec!["y".into()], Attribute::None)
            .unwrap();
        b.add_output("y").unwrap();
        let program = b.finish();
        assert_eq!(program.count(TosaOp::Abs), 1);
        assert_eq!(program.inputs, vec!["x".to_string()]);
    }

    #[test]
    fn test_duplicate_and_unique_names() {
        let mut b = builder();
        b.add_tensor("t", &[1], TosaDType::Int8).unwrap();
        assert!(b.add_tensor("t", &[1], TosaDType::Int8).is_err());
        let name = b.add_intermediate("t", &[1], TosaDType::Int32);
        assert_eq!(name, "t_1");
        let c = b.add_const("t", TosaDType::Int8, TensorData::full(DType::Int8, vec![1], 0.0));
        assert_eq!(c, "t_2");
        assert!(b.tensor(&c).and_then(|t| t.data.as_ref()).is_some());
    }

    #[test]
    fn test_program_json() {
        let mut b = builder();
        b.add_input("x", &[1, 2], TosaDType::Fp32).unwrap();
        b.add_output("x").unwrap();
        let program = b.finish();
        let text = program.to_json_pretty().unwrap();
        assert!(text.contains("\"TOSA-1.0+FP\""));
        assert_eq!(TosaProgram::from_json(&text).unwrap(), program);
    }
}
