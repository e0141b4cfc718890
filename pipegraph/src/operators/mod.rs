//! The operator contract.
//!
//! An [`Operator`] describes one operator type: its inputs and outputs, how it
//! splits work into [`Task`]s, how a container executes them, and optionally
//! how it rewrites itself at run time or projects keys for incremental runs.

mod materialize;
mod registry;
mod util;

pub use materialize::{materialize_non_default_inputs, MaterializeOperator, MATERIALIZE_OP};
pub use registry::OperatorRegistry;
pub use util::{group_items, map_needed_inputs, map_output_keys, simple_tasks};

use crate::catalog::{InputSpec, OperatorNode, OutputSpec};
use crate::datasets::{Dataset, DatasetStore, Item};
use crate::errors::Result;
use crate::exec::Task;
use crate::graph::{ExecutionGraph, VirtualNode, VirtualParent};
use crate::jobs::JobOp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Container image used when an operator does not name one.
pub const DEFAULT_IMAGE: &str = "pipegraph/basic";

/// Items per input name, one list per parent.
pub type InputItems = BTreeMap<String, Vec<Vec<Item>>>;

/// Keys per input name, one list per parent.
pub type InputKeys = BTreeMap<String, Vec<Vec<String>>>;

/// Descriptive metadata of an operator type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Operator type id, referenced by nodes.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
}

impl OperatorConfig {
    /// Creates a config.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// What a container needs to execute a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runnable {
    /// Node name.
    pub name: String,
    /// Operator type.
    pub op: String,
    /// Serialized parameters.
    pub params: String,
    /// Parent datasets per input name.
    pub input_datasets: BTreeMap<String, Vec<Dataset>>,
    /// Output dataset per output name.
    pub output_datasets: BTreeMap<String, Dataset>,
}

impl Runnable {
    /// Builds the runnable of a node.
    #[must_use]
    pub fn for_node(
        node: &VirtualNode,
        input_datasets: BTreeMap<String, Vec<Dataset>>,
        output_datasets: BTreeMap<String, Dataset>,
    ) -> Self {
        Self {
            name: node.name.clone(),
            op: node.op.clone(),
            params: node.params.clone(),
            input_datasets,
            output_datasets,
        }
    }
}

/// Services available to an operator while preparing an executable.
#[derive(Clone)]
pub struct PrepareContext {
    /// URL of the coordinator.
    pub coordinator_url: String,
    /// Store the executable writes output items to.
    pub datasets: Arc<dyn DatasetStore>,
}

impl std::fmt::Debug for PrepareContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepareContext")
            .field("coordinator_url", &self.coordinator_url)
            .finish_non_exhaustive()
    }
}

/// A prepared operator instance living inside a container.
#[async_trait]
pub trait Executable: Send + Sync {
    /// Number of tasks the container runs at once.
    fn parallelism(&self) -> usize {
        1
    }

    /// Executes one task.
    async fn apply(&self, task: &Task) -> Result<()>;
}

/// An operator type.
pub trait Operator: Send + Sync {
    /// Descriptive metadata.
    fn config(&self) -> OperatorConfig;

    /// Declared inputs for the given parameters.
    fn inputs(&self, params: &str) -> Vec<InputSpec>;

    /// Declared outputs for the given parameters and parent data types.
    fn outputs(&self, params: &str, input_types: &BTreeMap<String, Vec<String>>) -> Vec<OutputSpec>;

    /// Container image that can run this operator.
    fn image_name(&self, _runnable: &Runnable) -> String {
        DEFAULT_IMAGE.to_string()
    }

    /// Splits the parent items into tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the items cannot be turned into tasks.
    fn get_tasks(&self, _runnable: &Runnable, items: &InputItems) -> Result<Vec<Task>> {
        Ok(simple_tasks(items))
    }

    /// Builds the executable a container runs tasks with.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid.
    fn prepare(&self, runnable: &Runnable, ctx: &PrepareContext) -> Result<Box<dyn Executable>>;

    /// Turns a configured node into its run-time form.
    fn virtualize(
        &self,
        node: &OperatorNode,
        parents: BTreeMap<String, Vec<VirtualParent>>,
    ) -> VirtualNode {
        VirtualNode {
            name: node.name.clone(),
            op: node.op.clone(),
            params: node.params.clone(),
            parents,
            outputs: node.outputs.clone(),
            orig_node: node.clone(),
            virtual_key: String::new(),
        }
    }

    /// Optionally replaces the node with a subgraph just before it executes.
    ///
    /// Must return `None` once the node's inputs need no further rewriting.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs cannot be inspected.
    fn resolve(
        &self,
        _node: &VirtualNode,
        _parent_datasets: &BTreeMap<String, Vec<Dataset>>,
        _items: &InputItems,
    ) -> Result<Option<ExecutionGraph>> {
        Ok(None)
    }

    /// Whether the operator supports key projection.
    fn is_incremental(&self) -> bool {
        false
    }

    /// Output keys produced from the given input keys.
    fn output_keys(&self, _node: &VirtualNode, inputs: &InputKeys) -> Vec<String> {
        map_output_keys(inputs)
    }

    /// Input keys needed to produce the given output keys.
    fn needed_inputs(&self, node: &VirtualNode, outputs: &[String]) -> InputKeys {
        map_needed_inputs(node, outputs)
    }

    /// Operator-specific progress state attached to execution jobs.
    fn job_op(&self, _runnable: &Runnable) -> Option<Box<dyn JobOp>> {
        None
    }
}
