//! Exported programs: a graph plus the data of its static values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::IrError;
use crate::graph::{Graph, Value, ValueId, ValueKind};
use crate::tensor::TensorData;

/// Parameter, buffer and constant data keyed by value name.
pub type StateDict = BTreeMap<String, TensorData>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportedProgram {
    pub graph: Graph,
    #[serde(default)]
    pub state: StateDict,
}

impl ExportedProgram {
    pub fn new(graph: Graph, state: StateDict) -> Self {
        ExportedProgram { graph, state }
    }

    pub fn from_json(text: &str) -> Result<Self, IrError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, IrError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Data backing a static value.
    pub fn data(&self, id: ValueId) -> Option<&TensorData> {
        lookup(&self.graph, &self.state, id)
    }

    /// Validate the graph and check that every referenced static value has
    /// data of the declared shape.
    pub fn validate(&self) -> Result<(), IrError> {
        self.graph.validate()?;
        for id in self.graph.used_static_values() {
            let value = self.graph.value(id);
            let data = self.state.get(&value.name).ok_or_else(|| IrError::ElementCountMismatch {
                what: format!("state entry '{}'", value.name),
                expected: value.numel(),
                actual: 0,
            })?;
            if data.numel() != value.numel() {
                return Err(IrError::ElementCountMismatch {
                    what: format!("state entry '{}'", value.name),
                    expected: value.numel(),
                    actual: data.numel(),
                });
            }
        }
        Ok(())
    }
}

/// Data of `id` when it is a static value with an entry in `state`.
pub fn lookup<'a>(graph: &Graph, state: &'a StateDict, id: ValueId) -> Option<&'a TensorData> {
    let value = graph.values.get(id.0)?;
    if !value.kind.is_static() {
        return None;
    }
    state.get(&value.name)
}

/// Add a lifted constant with a fresh name derived from `hint`.
pub fn add_constant(
    graph: &mut Graph,
    state: &mut StateDict,
    hint: &str,
    data: TensorData,
) -> ValueId {
    let mut name = graph.fresh_name(hint);
    let mut n = 1;
    while state.contains_key(&name) {
        name = graph.fresh_name(&format!("{hint}_c{n}"));
        n += 1;
    }
    let id = graph.add_value(Value::new(
        name.clone(),
        data.shape.clone(),
        data.dtype,
        ValueKind::Constant,
    ));
    state.insert(name, data);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::graph::Arg;
    use crate::ops::aten;

    fn program() -> ExportedProgram {
        let mut graph = Graph::new();
        let mut state = StateDict::new();
        let x = graph.add_input("x", vec![2], DType::Float32);
        let c = add_constant(
            &mut graph,
            &mut state,
            "bias",
            TensorData::from_f64(DType::Float32, vec![2], vec![1.0, 2.0]).unwrap(),
        );
        let add = graph.create_node(
            "add",
            aten::ADD,
            vec![Arg::Value(x), Arg::Value(c)],
            vec![2],
            DType::Float32,
        );
        let out = add.output();
        graph.push_node(add);
        graph.add_output(out);
        ExportedProgram::new(graph, state)
    }

    #[test]
    fn test_json_round_trip() {
        let p = program();
        let text = p.to_json_pretty().unwrap();
        let back = ExportedProgram::from_json(&text).unwrap();
        assert_eq!(back, p);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn test_missing_state_is_invalid() {
        let mut p = program();
        p.state.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_add_constant_names_are_unique() {
        let mut p = program();
        let data = TensorData::full(DType::Int8, vec![1], 3.0);
        let a = add_constant(&mut p.graph, &mut p.state, "bias", data.clone());
        let b = add_constant(&mut p.graph, &mut p.state, "bias", data);
        assert_ne!(p.graph.value(a).name, p.graph.value(b).name);
        assert_eq!(p.data(a).unwrap().to_i64_vec(), vec![3]);
    }
}
