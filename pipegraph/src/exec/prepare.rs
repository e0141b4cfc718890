//! Turning a node with ready parents into tasks.

use super::Task;
use crate::datasets::{
    computed_keys, output_hash_key, resolve_output_datasets, Dataset, DatasetStore, OutputDatasets,
};
use crate::errors::{ConfigurationError, PipegraphError, Result, SchedulingError};
use crate::graph::{ExecutionGraph, GraphId, VirtualNode};
use crate::operators::{InputItems, Operator, Runnable};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Parent datasets and items of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInputs {
    /// Parent datasets per input name.
    pub datasets: BTreeMap<String, Vec<Dataset>>,
    /// Items of each parent dataset.
    pub items: InputItems,
    /// True if every operator parent's dataset is done.
    pub parents_done: bool,
}

/// Options of [`prepare_run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Clear the outputs and run even if they are done.
    pub force: bool,
    /// Accept incomplete parents and skip keys already computed.
    pub incremental: bool,
    /// Only produce these output keys.
    pub limit_output_keys: Option<BTreeSet<String>>,
}

/// Everything needed to execute one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRun {
    /// What the container runs.
    pub runnable: Runnable,
    /// Tasks to dispatch.
    pub tasks: Vec<Task>,
    /// Whether finishing every task leaves the node complete.
    pub will_be_done: bool,
    /// The node's output datasets.
    pub outputs: OutputDatasets,
}

/// Collects the datasets and items feeding `node`.
///
/// # Errors
///
/// Returns a configuration error when an operator parent has no dataset, or
/// has one that is not done and `allow_incomplete` is false.
pub fn gather_inputs(
    store: &dyn DatasetStore,
    graph: &ExecutionGraph,
    hashes: &HashMap<GraphId, String>,
    node: &VirtualNode,
    allow_incomplete: bool,
) -> Result<NodeInputs> {
    let mut inputs = NodeInputs {
        parents_done: true,
        ..NodeInputs::default()
    };

    for (name, plist) in &node.parents {
        let mut datasets = Vec::with_capacity(plist.len());
        let mut items = Vec::with_capacity(plist.len());

        for parent in plist {
            let ds = if parent.graph_id.is_operator() {
                let parent_name = graph.display_name(&parent.graph_id);
                let hash = hashes
                    .get(&parent.graph_id)
                    .ok_or_else(|| SchedulingError::MissingHash(parent.graph_id.to_string()))?;
                let ds = store
                    .find_by_hash(&output_hash_key(hash, &parent.output))
                    .ok_or_else(|| {
                        ConfigurationError::new(format!(
                            "dataset for parent node {parent_name}[{}] is missing",
                            parent.output
                        ))
                        .with_node(node.name.clone())
                    })?;
                if !ds.done && !allow_incomplete {
                    return Err(ConfigurationError::new(format!(
                        "dataset for parent node {parent_name}[{}] is not done",
                        parent.output
                    ))
                    .with_node(node.name.clone())
                    .into());
                }
                inputs.parents_done &= ds.done;
                ds
            } else {
                store
                    .get(parent.graph_id.id)
                    .ok_or_else(|| PipegraphError::not_found("dataset", parent.graph_id.id))?
            };
            items.push(store.list_items(ds.id)?);
            datasets.push(ds);
        }

        inputs.datasets.insert(name.clone(), datasets);
        inputs.items.insert(name.clone(), items);
    }

    Ok(inputs)
}

/// Prepares the execution of `node` at content hash `hash`.
///
/// Returns `None` when the outputs are already done and `force` is not set.
///
/// # Errors
///
/// Propagates store and task derivation errors.
pub fn prepare_run(
    store: &dyn DatasetStore,
    operator: &dyn Operator,
    node: &VirtualNode,
    hash: &str,
    inputs: &NodeInputs,
    options: &PrepareOptions,
) -> Result<Option<PreparedRun>> {
    let outputs = resolve_output_datasets(store, node, hash, true)?;

    if options.force {
        for ds in outputs.existing() {
            store.clear(ds.id)?;
            store.set_done(ds.id, false)?;
        }
    } else if outputs.all_done() {
        debug!(node = %node.name, "outputs already done");
        return Ok(None);
    }

    let output_datasets = outputs.complete().ok_or_else(|| {
        PipegraphError::Internal(format!("output datasets of {} were not created", node.name))
    })?;
    let runnable = Runnable::for_node(node, inputs.datasets.clone(), output_datasets);
    let mut tasks = operator.get_tasks(&runnable, &inputs.items)?;

    if options.incremental {
        let computed = computed_keys(store, &outputs)?;
        tasks.retain(|task| !computed.contains(&task.key));
    }

    let mut will_be_done = inputs.parents_done;
    if let Some(limit) = &options.limit_output_keys {
        let before = tasks.len();
        tasks.retain(|task| limit.contains(&task.key));
        if tasks.len() != before {
            will_be_done = false;
        }
    }

    debug!(node = %node.name, tasks = tasks.len(), will_be_done, "prepared run");
    Ok(Some(PreparedRun {
        runnable,
        tasks,
        will_be_done,
        outputs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ParentRef;
    use crate::datasets::{DatasetKind, InMemoryDatasetStore, Item};
    use crate::graph::{compute_hashes, Node, VirtualParent};
    use crate::testing::fixtures::{operator_node, virtual_node};
    use crate::testing::RecordingOperator;
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: InMemoryDatasetStore,
        graph: ExecutionGraph,
        hashes: HashMap<GraphId, String>,
        raw: Dataset,
    }

    fn fixture() -> Fixture {
        let store = InMemoryDatasetStore::new();
        let raw = store.create_dataset("raw", DatasetKind::Data, "image", None);
        for key in ["k1", "k2", "k3"] {
            store.add_item(raw.id, Item::new(key)).unwrap();
        }

        let mut graph = ExecutionGraph::new();
        graph.insert(raw.clone());
        let mut a =
            virtual_node(&operator_node(1, "a", "resize", vec![vec![ParentRef::dataset(raw.id)]]));
        a.parents.insert("input".to_string(), vec![VirtualParent::dataset(raw.id, "image")]);
        graph.insert(a.clone());
        let from_a = vec![vec![ParentRef::operator(1, "output")]];
        let mut b = virtual_node(&operator_node(2, "b", "resize", from_a));
        b.parents.insert(
            "input".to_string(),
            vec![VirtualParent::operator(a.graph_id(), "output", "table")],
        );
        graph.insert(b);

        let hashes = compute_hashes(&graph, &HashMap::new()).unwrap();
        Fixture { store, graph, hashes, raw }
    }

    fn node<'a>(f: &'a Fixture, id: i64) -> &'a VirtualNode {
        f.graph.operator(&GraphId::operator(id)).unwrap()
    }

    #[test]
    fn test_gather_inputs_from_dataset_parent() {
        let f = fixture();
        let inputs = gather_inputs(&f.store, &f.graph, &f.hashes, node(&f, 1), false).unwrap();
        assert!(inputs.parents_done);
        assert_eq!(inputs.datasets["input"], vec![f.raw.clone()]);
        assert_eq!(inputs.items["input"][0].len(), 3);
    }

    #[test]
    fn test_gather_inputs_missing_parent_dataset() {
        let f = fixture();
        let err = gather_inputs(&f.store, &f.graph, &f.hashes, node(&f, 2), false).unwrap_err();
        match err {
            PipegraphError::Configuration(e) => {
                assert!(e.message.contains("a[output] is missing"));
                assert_eq!(e.node.as_deref(), Some("b"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_gather_inputs_incomplete_parent() {
        let f = fixture();
        let a = node(&f, 1);
        resolve_output_datasets(&f.store, a, &f.hashes[&a.graph_id()], true).unwrap();

        assert!(gather_inputs(&f.store, &f.graph, &f.hashes, node(&f, 2), false).is_err());
        let inputs = gather_inputs(&f.store, &f.graph, &f.hashes, node(&f, 2), true).unwrap();
        assert!(!inputs.parents_done);
    }

    #[test]
    fn test_prepare_run_creates_outputs_and_tasks() {
        let f = fixture();
        let a = node(&f, 1);
        let inputs = gather_inputs(&f.store, &f.graph, &f.hashes, a, false).unwrap();
        let run = prepare_run(
            &f.store,
            &RecordingOperator::new("resize"),
            a,
            &f.hashes[&a.graph_id()],
            &inputs,
            &PrepareOptions::default(),
        )
        .unwrap()
        .unwrap();

        assert!(run.will_be_done);
        let keys: Vec<&str> = run.tasks.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
        assert_eq!(run.runnable.output_datasets["output"].name, "a[output]");
    }

    #[test]
    fn test_prepare_run_skips_done_unless_forced() {
        let f = fixture();
        let a = node(&f, 1);
        let hash = &f.hashes[&a.graph_id()];
        let inputs = gather_inputs(&f.store, &f.graph, &f.hashes, a, false).unwrap();
        let op = RecordingOperator::new("resize");

        let run = prepare_run(&f.store, &op, a, hash, &inputs, &PrepareOptions::default())
            .unwrap()
            .unwrap();
        let out = run.outputs.get("output").unwrap().clone();
        f.store.add_item(out.id, Item::new("k1")).unwrap();
        f.store.set_done(out.id, true).unwrap();

        assert!(prepare_run(&f.store, &op, a, hash, &inputs, &PrepareOptions::default())
            .unwrap()
            .is_none());

        let forced = PrepareOptions {
            force: true,
            ..PrepareOptions::default()
        };
        let run = prepare_run(&f.store, &op, a, hash, &inputs, &forced).unwrap().unwrap();
        assert_eq!(run.tasks.len(), 3);
        assert!(f.store.list_items(out.id).unwrap().is_empty());
        assert!(!f.store.get(out.id).unwrap().done);
    }

    #[test]
    fn test_prepare_run_incremental_and_limited() {
        let f = fixture();
        let a = node(&f, 1);
        let hash = &f.hashes[&a.graph_id()];
        let inputs = gather_inputs(&f.store, &f.graph, &f.hashes, a, false).unwrap();
        let op = RecordingOperator::new("resize").incremental();

        let outputs = resolve_output_datasets(&f.store, a, hash, true).unwrap();
        f.store
            .add_item(outputs.get("output").unwrap().id, Item::new("k1"))
            .unwrap();

        let options = PrepareOptions {
            incremental: true,
            limit_output_keys: Some(BTreeSet::from(["k2".to_string()])),
            ..PrepareOptions::default()
        };
        let run = prepare_run(&f.store, &op, a, hash, &inputs, &options).unwrap().unwrap();
        assert_eq!(run.tasks.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(), vec!["k2"]);
        assert!(!run.will_be_done);

        let options = PrepareOptions {
            incremental: true,
            ..PrepareOptions::default()
        };
        let run = prepare_run(&f.store, &op, a, hash, &inputs, &options).unwrap().unwrap();
        assert_eq!(run.tasks.len(), 2);
        assert!(run.will_be_done);
    }
}
