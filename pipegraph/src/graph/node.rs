//! Graph nodes and the execution graph container.

use super::GraphId;
use crate::catalog::{OperatorNode, OutputSpec};
use crate::datasets::Dataset;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// A node of an execution graph.
pub trait Node {
    /// Dependency edges, keyed by a label that is unique per node.
    fn graph_parents(&self) -> BTreeMap<String, GraphId>;

    /// Hash of the node's own configuration, independent of its ancestry.
    fn local_hash(&self) -> Vec<u8>;

    /// The node's identifier.
    fn graph_id(&self) -> GraphId;
}

/// A parent edge of a [`VirtualNode`], pointing at a concrete graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualParent {
    /// The parent node.
    pub graph_id: GraphId,
    /// For operator parents, the output consumed. Empty for datasets.
    #[serde(default)]
    pub output: String,
    /// Data type flowing along this edge.
    pub data_type: String,
}

impl VirtualParent {
    /// Edge consuming output `output` of an operator node.
    #[must_use]
    pub fn operator(
        graph_id: GraphId,
        output: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            graph_id,
            output: output.into(),
            data_type: data_type.into(),
        }
    }

    /// Edge consuming a raw dataset.
    #[must_use]
    pub fn dataset(id: i64, data_type: impl Into<String>) -> Self {
        Self {
            graph_id: GraphId::dataset(id),
            output: String::new(),
            data_type: data_type.into(),
        }
    }
}

/// A run-time instance of an operator node.
///
/// Derived from a configured [`OperatorNode`] for one execution, or created
/// by resolution. Parents are graph ids rather than catalog references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualNode {
    /// Display name.
    pub name: String,
    /// Operator type.
    pub op: String,
    /// Serialized parameters.
    pub params: String,
    /// Parent edges per input name.
    pub parents: BTreeMap<String, Vec<VirtualParent>>,
    /// Outputs this node produces.
    pub outputs: Vec<OutputSpec>,
    /// The configured node this instance was derived from.
    pub orig_node: OperatorNode,
    /// Non-empty only for nodes created by resolution.
    #[serde(default)]
    pub virtual_key: String,
}

impl VirtualNode {
    /// Data types of each input's parents, in parent order.
    #[must_use]
    pub fn input_types(&self) -> BTreeMap<String, Vec<String>> {
        self.parents
            .iter()
            .map(|(name, plist)| {
                (
                    name.clone(),
                    plist.iter().map(|p| p.data_type.clone()).collect(),
                )
            })
            .collect()
    }

    /// Returns the declared output with the given name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

impl Node for VirtualNode {
    fn graph_parents(&self) -> BTreeMap<String, GraphId> {
        let mut parents = BTreeMap::new();
        for (name, plist) in &self.parents {
            for (i, parent) in plist.iter().enumerate() {
                let label = if parent.graph_id.is_operator() {
                    format!("{name}-{i}-n[{}]", parent.output)
                } else {
                    format!("{name}-{i}-d")
                };
                parents.insert(label, parent.graph_id.clone());
            }
        }
        parents
    }

    fn local_hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(format!("op={}\n", self.op).as_bytes());
        hasher.update(format!("params={}\n", self.params).as_bytes());
        hasher.finalize().to_vec()
    }

    fn graph_id(&self) -> GraphId {
        GraphId::virtual_operator(self.orig_node.id, self.virtual_key.clone())
    }
}

impl Node for Dataset {
    fn graph_parents(&self) -> BTreeMap<String, GraphId> {
        BTreeMap::new()
    }

    fn local_hash(&self) -> Vec<u8> {
        Sha256::digest(format!("dataset={}\n", self.id).as_bytes()).to_vec()
    }

    fn graph_id(&self) -> GraphId {
        GraphId::dataset(self.id)
    }
}

/// Either kind of execution graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    /// An operator instance.
    Operator(Box<VirtualNode>),
    /// A dataset leaf.
    Dataset(Dataset),
}

impl GraphNode {
    /// Returns the operator instance, if this is one.
    #[must_use]
    pub fn as_operator(&self) -> Option<&VirtualNode> {
        match self {
            Self::Operator(node) => Some(node),
            Self::Dataset(_) => None,
        }
    }

    /// Returns the dataset, if this is one.
    #[must_use]
    pub fn as_dataset(&self) -> Option<&Dataset> {
        match self {
            Self::Operator(_) => None,
            Self::Dataset(ds) => Some(ds),
        }
    }

    /// Name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Operator(node) => &node.name,
            Self::Dataset(ds) => &ds.name,
        }
    }
}

impl From<VirtualNode> for GraphNode {
    fn from(node: VirtualNode) -> Self {
        Self::Operator(Box::new(node))
    }
}

impl From<Dataset> for GraphNode {
    fn from(ds: Dataset) -> Self {
        Self::Dataset(ds)
    }
}

impl Node for GraphNode {
    fn graph_parents(&self) -> BTreeMap<String, GraphId> {
        match self {
            Self::Operator(node) => node.graph_parents(),
            Self::Dataset(ds) => ds.graph_parents(),
        }
    }

    fn local_hash(&self) -> Vec<u8> {
        match self {
            Self::Operator(node) => node.local_hash(),
            Self::Dataset(ds) => ds.local_hash(),
        }
    }

    fn graph_id(&self) -> GraphId {
        match self {
            Self::Operator(node) => node.graph_id(),
            Self::Dataset(ds) => ds.graph_id(),
        }
    }
}

/// A mapping from graph id to node.
///
/// Grows monotonically during a run; inserting an id that is already present
/// replaces the node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionGraph {
    nodes: HashMap<GraphId, GraphNode>,
}

impl ExecutionGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node under its own id, returning the node it replaced.
    pub fn insert(&mut self, node: impl Into<GraphNode>) -> Option<GraphNode> {
        let node = node.into();
        self.nodes.insert(node.graph_id(), node)
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: &GraphId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Looks up an operator node.
    #[must_use]
    pub fn operator(&self, id: &GraphId) -> Option<&VirtualNode> {
        self.nodes.get(id).and_then(GraphNode::as_operator)
    }

    /// Returns true if the id is part of the graph.
    #[must_use]
    pub fn contains(&self, id: &GraphId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<GraphId> {
        let mut ids: Vec<GraphId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Iterates over all nodes in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&GraphId, &GraphNode)> {
        self.nodes.iter()
    }

    /// Display name of a node, falling back to its id.
    #[must_use]
    pub fn display_name(&self, id: &GraphId) -> String {
        match self.nodes.get(id) {
            Some(GraphNode::Operator(node)) if node.virtual_key.is_empty() => node.name.clone(),
            Some(GraphNode::Operator(node)) => format!("{}[{}]", node.name, node.virtual_key),
            Some(GraphNode::Dataset(ds)) => ds.name.clone(),
            None => id.to_string(),
        }
    }
}

impl IntoIterator for ExecutionGraph {
    type Item = (GraphId, GraphNode);
    type IntoIter = std::collections::hash_map::IntoIter<GraphId, GraphNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl FromIterator<GraphNode> for ExecutionGraph {
    fn from_iter<T: IntoIterator<Item = GraphNode>>(iter: T) -> Self {
        let mut graph = Self::new();
        for node in iter {
            graph.insert(node);
        }
        graph
    }
}
