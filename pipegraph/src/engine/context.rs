//! Shared services of one engine instance.

use crate::catalog::{NodeStore, OperatorNode, ParentRef};
use crate::config::EngineConfig;
use crate::datasets::DatasetStore;
use crate::errors::{ConfigurationError, PipegraphError, Result};
use crate::events::EventSink;
use crate::exec::TaskExecutor;
use crate::graph::{GraphId, GraphNode, GraphSource, VirtualParent};
use crate::jobs::{ConflictGuard, JobRegistry};
use crate::operators::OperatorRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a run needs, constructed once per engine.
pub struct EngineContext {
    /// Engine configuration.
    pub config: EngineConfig,
    /// Configured operator nodes.
    pub catalog: Arc<NodeStore>,
    /// Dataset persistence.
    pub datasets: Arc<dyn DatasetStore>,
    /// Registered operator types.
    pub operators: Arc<OperatorRegistry>,
    /// Live and persisted jobs.
    pub jobs: Arc<JobRegistry>,
    /// Task dispatch.
    pub executor: TaskExecutor,
    /// Run event sink.
    pub events: Arc<dyn EventSink>,
    /// Cross-job conflict detection.
    pub conflicts: ConflictGuard,
}

impl EngineContext {
    /// Turns a configured parent reference into a graph edge.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the parent node, its output, or the
    /// dataset does not exist.
    pub fn virtual_parent(&self, node: &OperatorNode, parent: &ParentRef) -> Result<VirtualParent> {
        match parent {
            ParentRef::Operator { id, output } => {
                let parent_node = self.catalog.get(*id).ok_or_else(|| {
                    ConfigurationError::new(format!("parent node {id} does not exist"))
                        .with_node(node.name.clone())
                })?;
                let spec = parent_node
                    .outputs
                    .iter()
                    .find(|o| o.name == *output)
                    .ok_or_else(|| {
                        let msg =
                            format!("parent node {} has no output {output}", parent_node.name);
                        ConfigurationError::new(msg).with_node(node.name.clone())
                    })?;
                Ok(VirtualParent::operator(
                    GraphId::operator(*id),
                    output.clone(),
                    spec.data_type.clone(),
                ))
            }
            ParentRef::Dataset { id } => {
                let ds = self.datasets.get(*id).ok_or_else(|| {
                    ConfigurationError::new(format!("parent dataset {id} does not exist"))
                        .with_node(node.name.clone())
                })?;
                Ok(VirtualParent::dataset(*id, ds.data_type))
            }
        }
    }

    /// Graph edges of a configured node, per input name.
    ///
    /// # Errors
    ///
    /// Fails if any parent cannot be resolved.
    pub fn virtual_parents(
        &self,
        node: &OperatorNode,
    ) -> Result<BTreeMap<String, Vec<VirtualParent>>> {
        node.parents_by_input()
            .into_iter()
            .map(|(input, refs)| {
                let parents = refs
                    .iter()
                    .map(|parent| self.virtual_parent(node, parent))
                    .collect::<Result<Vec<_>>>()?;
                Ok((input.name.clone(), parents))
            })
            .collect()
    }
}

impl GraphSource for EngineContext {
    fn fetch(&self, id: &GraphId) -> Result<GraphNode> {
        if id.is_virtual() {
            return Err(PipegraphError::Internal(format!("virtual node {id} cannot be loaded")));
        }
        if !id.is_operator() {
            return self
                .datasets
                .get(id.id)
                .map(GraphNode::from)
                .ok_or_else(|| PipegraphError::not_found("dataset", id.id));
        }

        let node = self
            .catalog
            .get(id.id)
            .ok_or_else(|| PipegraphError::not_found("node", id.id))?;
        let operator = self.operators.get(&node.op)?;
        let parents = self.virtual_parents(&node)?;
        Ok(GraphNode::from(operator.virtualize(&node, parents)))
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("operators", &self.operators)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}
