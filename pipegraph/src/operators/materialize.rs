//! The built-in `materialize` operator.
//!
//! Copies every input item into a fresh output dataset under the default
//! storage provider. Operators that cannot read from other providers resolve
//! into a `materialize` step with [`materialize_non_default_inputs`].

use super::{Executable, InputItems, Operator, OperatorConfig, PrepareContext, Runnable};
use crate::catalog::{InputSpec, OutputSpec};
use crate::datasets::{Dataset, DatasetStore, Item};
use crate::errors::{PipegraphError, Result};
use crate::exec::Task;
use crate::graph::{ExecutionGraph, GraphNode, Node, VirtualNode, VirtualParent};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Operator type id of [`MaterializeOperator`].
pub const MATERIALIZE_OP: &str = "materialize";

const INPUT: &str = "inputs";

fn output_name(i: usize) -> String {
    format!("outputs{i}")
}

/// Identity operator that materializes its inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaterializeOperator;

impl Operator for MaterializeOperator {
    fn config(&self) -> OperatorConfig {
        OperatorConfig::new(MATERIALIZE_OP, "Materialize")
            .with_description("Copy input datasets into the default storage provider")
    }

    fn inputs(&self, _params: &str) -> Vec<InputSpec> {
        vec![InputSpec::new(INPUT).variable()]
    }

    fn outputs(
        &self,
        _params: &str,
        input_types: &BTreeMap<String, Vec<String>>,
    ) -> Vec<OutputSpec> {
        input_types
            .get(INPUT)
            .map(|types| {
                types
                    .iter()
                    .enumerate()
                    .map(|(i, t)| OutputSpec::new(output_name(i), t.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn prepare(&self, runnable: &Runnable, ctx: &PrepareContext) -> Result<Box<dyn Executable>> {
        let count = runnable.input_datasets.get(INPUT).map_or(0, Vec::len);
        let outputs = (0..count)
            .map(|i| {
                runnable.output_datasets.get(&output_name(i)).cloned().ok_or_else(|| {
                    let msg = format!("{} is missing output {}", runnable.name, output_name(i));
                    PipegraphError::config(msg)
                })
            })
            .collect::<Result<Vec<Dataset>>>()?;
        Ok(Box::new(MaterializeExecutable {
            outputs,
            store: ctx.datasets.clone(),
        }))
    }

    fn is_incremental(&self) -> bool {
        true
    }
}

struct MaterializeExecutable {
    outputs: Vec<Dataset>,
    store: Arc<dyn DatasetStore>,
}

#[async_trait]
impl Executable for MaterializeExecutable {
    async fn apply(&self, task: &Task) -> Result<()> {
        let Some(lists) = task.items.get(INPUT) else {
            return Ok(());
        };
        for (i, list) in lists.iter().enumerate() {
            let (Some(input), Some(output)) = (list.first(), self.outputs.get(i)) else {
                continue;
            };
            let item = Item {
                key: task.key.clone(),
                ext: input.ext.clone(),
                format: input.format.clone(),
                metadata: input.metadata.clone(),
                provider: None,
            };
            self.store.add_item(output.id, item)?;
        }
        Ok(())
    }
}

/// Rewrites `node` so that parents stored under a non-default provider are
/// read through a `materialize` step.
///
/// Returns `None` when every parent item already uses the default provider,
/// which is always the case once the rewrite has executed.
#[must_use]
pub fn materialize_non_default_inputs(
    node: &VirtualNode,
    items: &InputItems,
) -> Option<ExecutionGraph> {
    let mut graph = ExecutionGraph::new();
    let mut replacement = node.clone();

    for (name, plist) in &node.parents {
        for (i, parent) in plist.iter().enumerate() {
            let non_default = items
                .get(name)
                .and_then(|lists| lists.get(i))
                .is_some_and(|list| list.iter().any(|item| !item.is_default_provider()));
            if !non_default {
                continue;
            }

            let mut parents = BTreeMap::new();
            parents.insert(INPUT.to_string(), vec![parent.clone()]);
            let materialize = VirtualNode {
                name: format!("{}-materialize-{name}-{i}", node.name),
                op: MATERIALIZE_OP.to_string(),
                params: String::new(),
                parents,
                outputs: vec![OutputSpec::new(output_name(0), parent.data_type.clone())],
                orig_node: node.orig_node.clone(),
                virtual_key: format!("materialize-{name}-{i}"),
            };

            if let Some(slot) = replacement.parents.get_mut(name).and_then(|p| p.get_mut(i)) {
                *slot = VirtualParent::operator(
                    materialize.graph_id(),
                    output_name(0),
                    parent.data_type.clone(),
                );
            }
            graph.insert(GraphNode::from(materialize));
        }
    }

    if graph.is_empty() {
        return None;
    }
    graph.insert(GraphNode::from(replacement));
    Some(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::{DatasetKind, InMemoryDatasetStore};
    use crate::graph::GraphId;
    use crate::testing::fixtures::{operator_node, virtual_node};
    use pretty_assertions::assert_eq;

    fn consumer() -> VirtualNode {
        let mut node = virtual_node(&operator_node(5, "train", "train", vec![]));
        node.parents.clear();
        node.parents.insert(
            "input".to_string(),
            vec![VirtualParent::dataset(1, "image"), VirtualParent::dataset(2, "image")],
        );
        node
    }

    fn items(providers: [Option<&str>; 2]) -> InputItems {
        let mut items = InputItems::new();
        items.insert(
            "input".to_string(),
            providers
                .iter()
                .map(|p| {
                    let item = Item::new("k1");
                    vec![match p {
                        Some(p) => item.with_provider(*p),
                        None => item,
                    }]
                })
                .collect(),
        );
        items
    }

    #[test]
    fn test_no_rewrite_for_default_provider() {
        assert!(materialize_non_default_inputs(&consumer(), &items([None, None])).is_none());
    }

    #[test]
    fn test_rewrite_inserts_materialize_step() {
        let node = consumer();
        let graph = materialize_non_default_inputs(&node, &items([None, Some("s3")])).unwrap();
        assert_eq!(graph.len(), 2);

        let materialize_id = GraphId::virtual_operator(5, "materialize-input-1");
        let materialize = graph.operator(&materialize_id).unwrap();
        assert_eq!(materialize.op, MATERIALIZE_OP);
        assert_eq!(materialize.parents["inputs"], vec![VirtualParent::dataset(2, "image")]);
        assert_eq!(materialize.outputs, vec![OutputSpec::new("outputs0", "image")]);

        let replaced = graph.operator(&GraphId::operator(5)).unwrap();
        assert_eq!(replaced.parents["input"][0], VirtualParent::dataset(1, "image"));
        assert_eq!(
            replaced.parents["input"][1],
            VirtualParent::operator(materialize_id, "outputs0", "image")
        );
    }

    #[test]
    fn test_outputs_follow_input_types() {
        let mut types = BTreeMap::new();
        types.insert("inputs".to_string(), vec!["image".to_string(), "video".to_string()]);
        assert_eq!(
            MaterializeOperator.outputs("", &types),
            vec![OutputSpec::new("outputs0", "image"), OutputSpec::new("outputs1", "video")]
        );
    }

    #[tokio::test]
    async fn test_executable_copies_to_default_provider() {
        let store: Arc<dyn DatasetStore> = Arc::new(InMemoryDatasetStore::new());
        let input = store.create_dataset("raw", DatasetKind::Data, "image", None);
        let output = store.create_dataset(
            "m[outputs0]",
            DatasetKind::Computed,
            "image",
            Some("h[outputs0]"),
        );

        let mut input_datasets = BTreeMap::new();
        input_datasets.insert("inputs".to_string(), vec![input]);
        let mut output_datasets = BTreeMap::new();
        output_datasets.insert("outputs0".to_string(), output.clone());
        let runnable = Runnable {
            name: "m".to_string(),
            op: MATERIALIZE_OP.to_string(),
            params: String::new(),
            input_datasets,
            output_datasets,
        };
        let ctx = PrepareContext {
            coordinator_url: String::new(),
            datasets: store.clone(),
        };
        let exec = MaterializeOperator.prepare(&runnable, &ctx).unwrap();

        let mut task_items = InputItems::new();
        task_items.insert(
            "inputs".to_string(),
            vec![vec![Item::new("k1").with_format("jpg", "jpeg").with_provider("s3")]],
        );
        exec.apply(&Task::new("k1").with_items(task_items)).await.unwrap();

        let written = store.list_items(output.id).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].key, "k1");
        assert_eq!(written[0].ext, "jpg");
        assert!(written[0].is_default_provider());
    }
}
