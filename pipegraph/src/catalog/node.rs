//! Operator node model.

use serde::{Deserialize, Serialize};

/// A declared input of an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Input name, unique per operator.
    pub name: String,
    /// Accepted data types. Empty accepts any type.
    #[serde(default)]
    pub data_types: Vec<String>,
    /// Whether the input accepts any number of parents.
    #[serde(default)]
    pub variable: bool,
}

impl InputSpec {
    /// Creates an input accepting a single parent of any type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_types: Vec::new(),
            variable: false,
        }
    }

    /// Marks the input as accepting any number of parents.
    #[must_use]
    pub fn variable(mut self) -> Self {
        self.variable = true;
        self
    }

    /// Restricts the accepted data types.
    #[must_use]
    pub fn with_data_types(mut self, types: Vec<String>) -> Self {
        self.data_types = types;
        self
    }
}

/// A declared output of an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Output name, unique per operator.
    pub name: String,
    /// Data type of the produced dataset.
    pub data_type: String,
}

impl OutputSpec {
    /// Creates an output spec.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A reference from an operator input to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentRef {
    /// One output of another operator node.
    Operator {
        /// Parent node id.
        id: i64,
        /// Output name on the parent.
        output: String,
    },
    /// A raw dataset.
    Dataset {
        /// Dataset id.
        id: i64,
    },
}

impl ParentRef {
    /// Reference to output `output` of operator node `id`.
    #[must_use]
    pub fn operator(id: i64, output: impl Into<String>) -> Self {
        Self::Operator {
            id,
            output: output.into(),
        }
    }

    /// Reference to dataset `id`.
    #[must_use]
    pub fn dataset(id: i64) -> Self {
        Self::Dataset { id }
    }

    /// Returns the node id if this points at an operator.
    #[must_use]
    pub fn operator_id(&self) -> Option<i64> {
        match self {
            Self::Operator { id, .. } => Some(*id),
            Self::Dataset { .. } => None,
        }
    }
}

/// A configured operator node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorNode {
    /// Catalog id, assigned on creation.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Operator type.
    pub op: String,
    /// Serialized parameters.
    #[serde(default)]
    pub params: String,
    /// Declared inputs.
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Parents per input, in input order.
    #[serde(default)]
    pub parents: Vec<Vec<ParentRef>>,
    /// Workspace the node belongs to.
    #[serde(default)]
    pub workspace: String,
}

impl OperatorNode {
    /// Creates an unsaved node with no parameters, inputs or parents.
    #[must_use]
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            op: op.into(),
            params: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parents: Vec::new(),
            workspace: String::new(),
        }
    }

    /// Sets the serialized parameters.
    #[must_use]
    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    /// Sets the declared inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Vec<InputSpec>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the declared outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Vec<OutputSpec>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the parents, one list per input.
    #[must_use]
    pub fn with_parents(mut self, parents: Vec<Vec<ParentRef>>) -> Self {
        self.parents = parents;
        self
    }

    /// Sets the workspace.
    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Pairs each input with its parents.
    #[must_use]
    pub fn parents_by_input(&self) -> Vec<(&InputSpec, &[ParentRef])> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                let parents = self.parents.get(i).map_or(&[][..], Vec::as_slice);
                (input, parents)
            })
            .collect()
    }

    /// Returns true if any input reads from operator node `node_id`.
    #[must_use]
    pub fn references(&self, node_id: i64) -> bool {
        self.parents
            .iter()
            .flatten()
            .any(|p| p.operator_id() == Some(node_id))
    }

    /// Removes edges to `node_id` whose output is not in `keep`.
    ///
    /// Returns true if any edge was removed.
    pub fn prune_parents(&mut self, node_id: i64, keep: &[String]) -> bool {
        let mut pruned = false;
        for plist in &mut self.parents {
            let before = plist.len();
            plist.retain(|p| match p {
                ParentRef::Operator { id, output } if *id == node_id => keep.contains(output),
                _ => true,
            });
            pruned |= plist.len() != before;
        }
        pruned
    }

    /// Pads the parent lists so there is one per input.
    pub(crate) fn normalize_parents(&mut self) {
        while self.parents.len() < self.inputs.len() {
            self.parents.push(Vec::new());
        }
    }
}

/// A partial update of an [`OperatorNode`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    /// New name.
    pub name: Option<String>,
    /// New operator type.
    pub op: Option<String>,
    /// New parameters.
    pub params: Option<String>,
    /// New inputs.
    pub inputs: Option<Vec<InputSpec>>,
    /// New outputs.
    pub outputs: Option<Vec<OutputSpec>>,
    /// New parents.
    pub parents: Option<Vec<Vec<ParentRef>>>,
}

impl NodeUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }

    /// Sets the outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Vec<OutputSpec>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Sets the parents.
    #[must_use]
    pub fn with_parents(mut self, parents: Vec<Vec<ParentRef>>) -> Self {
        self.parents = Some(parents);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_ref_serde() {
        let json = serde_json::to_value(ParentRef::operator(3, "output")).unwrap();
        assert_eq!(json["type"], "operator");
        assert_eq!(json["output"], "output");

        let back: ParentRef = serde_json::from_str(r#"{"type":"dataset","id":9}"#).unwrap();
        assert_eq!(back, ParentRef::dataset(9));
    }

    #[test]
    fn test_parents_by_input_pads_missing() {
        let node = OperatorNode::new("n", "op")
            .with_inputs(vec![InputSpec::new("a"), InputSpec::new("b")])
            .with_parents(vec![vec![ParentRef::dataset(1)]]);
        let pairs = node.parents_by_input();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].1, &[ParentRef::dataset(1)]);
        assert!(pairs[1].1.is_empty());
    }

    #[test]
    fn test_prune_parents() {
        let mut node = OperatorNode::new("n", "op").with_parents(vec![vec![
            ParentRef::operator(3, "boxes"),
            ParentRef::operator(3, "scores"),
            ParentRef::operator(4, "boxes"),
            ParentRef::dataset(3),
        ]]);

        assert!(node.prune_parents(3, &["scores".to_string()]));
        assert_eq!(
            node.parents[0],
            vec![
                ParentRef::operator(3, "scores"),
                ParentRef::operator(4, "boxes"),
                ParentRef::dataset(3),
            ]
        );
        assert!(!node.prune_parents(3, &["scores".to_string()]));
        assert!(node.prune_parents(3, &[]));
        assert!(!node.references(3));
        assert!(node.references(4));
    }
}
