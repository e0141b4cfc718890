//! Output datasets of graph nodes.

use super::{Dataset, DatasetKind, DatasetStore};
use crate::errors::Result;
use crate::graph::{Node, VirtualNode};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Hash key of the dataset holding output `output` of a node with hash `node_hash`.
#[must_use]
pub fn output_hash_key(node_hash: &str, output: &str) -> String {
    format!("{node_hash}[{output}]")
}

/// The datasets currently matching a node's outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputDatasets {
    /// Dataset per output name; `None` if no dataset matches the hash yet.
    pub datasets: BTreeMap<String, Option<Dataset>>,
}

impl OutputDatasets {
    /// True if every output has a dataset marked done. Vacuously true for
    /// nodes without outputs.
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.datasets
            .values()
            .all(|ds| ds.as_ref().is_some_and(|d| d.done))
    }

    /// Dataset of one output.
    #[must_use]
    pub fn get(&self, output: &str) -> Option<&Dataset> {
        self.datasets.get(output).and_then(Option::as_ref)
    }

    /// Every dataset that exists.
    pub fn existing(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values().flatten()
    }

    /// Returns the datasets if every output has one.
    #[must_use]
    pub fn complete(&self) -> Option<BTreeMap<String, Dataset>> {
        self.datasets
            .iter()
            .map(|(name, ds)| ds.clone().map(|d| (name.clone(), d)))
            .collect()
    }
}

/// Finds, and with `create` creates, the datasets for `node`'s outputs at
/// hash `node_hash`.
///
/// The node takes a reference on every matching dataset and drops the
/// references it held on datasets of other hashes, so outputs of a stale
/// configuration are collected once no other node shares them.
///
/// # Errors
///
/// Propagates store errors.
pub fn resolve_output_datasets(
    store: &dyn DatasetStore,
    node: &VirtualNode,
    node_hash: &str,
    create: bool,
) -> Result<OutputDatasets> {
    let owner = node.graph_id();
    let mut result = OutputDatasets::default();
    let mut kept = BTreeSet::new();

    for output in &node.outputs {
        let key = output_hash_key(node_hash, &output.name);
        let ds = match store.find_by_hash(&key) {
            Some(ds) => Some(ds),
            None if create => Some(store.create_dataset(
                &format!("{}[{}]", node.name, output.name),
                DatasetKind::Computed,
                &output.data_type,
                Some(&key),
            )),
            None => None,
        };
        if let Some(ds) = &ds {
            store.add_ref(ds.id, &owner)?;
            kept.insert(ds.id);
        }
        result.datasets.insert(output.name.clone(), ds);
    }

    for id in store.refs_of(&owner) {
        if !kept.contains(&id) && store.remove_ref(id, &owner)? {
            debug!(node = %node.name, dataset_id = id, "released stale output dataset");
        }
    }

    Ok(result)
}

/// Keys present in every output dataset.
///
/// Incremental operators produce the same keys in all outputs, so this is the
/// set of keys already computed at the node.
///
/// # Errors
///
/// Propagates store errors.
pub fn computed_keys(
    store: &dyn DatasetStore,
    outputs: &OutputDatasets,
) -> Result<BTreeSet<String>> {
    let mut keys: Option<BTreeSet<String>> = None;
    for ds in outputs.datasets.values() {
        let Some(ds) = ds else {
            return Ok(BTreeSet::new());
        };
        let current: BTreeSet<String> =
            store.list_items(ds.id)?.into_iter().map(|i| i.key).collect();
        keys = Some(match keys {
            Some(prev) => prev.intersection(&current).cloned().collect(),
            None => current,
        });
    }
    Ok(keys.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::OutputSpec;
    use crate::datasets::{InMemoryDatasetStore, Item};
    use crate::graph::GraphId;
    use crate::testing::fixtures::{operator_node, virtual_node};
    use pretty_assertions::assert_eq;

    fn two_output_node() -> VirtualNode {
        let mut node = virtual_node(&operator_node(3, "detect", "detect", vec![]));
        node.outputs = vec![
            OutputSpec::new("boxes", "detection"),
            OutputSpec::new("crops", "image"),
        ];
        node
    }

    #[test]
    fn test_resolve_without_create() {
        let store = InMemoryDatasetStore::new();
        let outputs = resolve_output_datasets(&store, &two_output_node(), "h1", false).unwrap();
        assert_eq!(outputs.datasets.len(), 2);
        assert!(outputs.get("boxes").is_none());
        assert!(!outputs.all_done());
        assert!(outputs.complete().is_none());
    }

    #[test]
    fn test_resolve_creates_named_datasets() {
        let store = InMemoryDatasetStore::new();
        let outputs = resolve_output_datasets(&store, &two_output_node(), "h1", true).unwrap();
        let boxes = outputs.get("boxes").unwrap();
        assert_eq!(boxes.name, "detect[boxes]");
        assert_eq!(boxes.hash.as_deref(), Some("h1[boxes]"));
        assert_eq!(boxes.kind, DatasetKind::Computed);
        assert_eq!(store.refs_of(&GraphId::operator(3)).len(), 2);
        assert!(outputs.complete().is_some());
    }

    #[test]
    fn test_new_hash_releases_old_datasets() {
        let store = InMemoryDatasetStore::new();
        let node = two_output_node();
        let old = resolve_output_datasets(&store, &node, "h1", true).unwrap();
        let old_id = old.get("boxes").unwrap().id;

        resolve_output_datasets(&store, &node, "h2", true).unwrap();
        assert!(store.get(old_id).is_none());
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn test_all_done() {
        let store = InMemoryDatasetStore::new();
        let node = two_output_node();
        assert!(!resolve_output_datasets(&store, &node, "h1", false).unwrap().all_done());

        let outputs = resolve_output_datasets(&store, &node, "h1", true).unwrap();
        for ds in outputs.existing() {
            store.set_done(ds.id, true).unwrap();
        }
        assert!(resolve_output_datasets(&store, &node, "h1", false).unwrap().all_done());

        let mut no_outputs = node.clone();
        no_outputs.outputs.clear();
        assert!(resolve_output_datasets(&store, &no_outputs, "h1", false).unwrap().all_done());
    }

    #[test]
    fn test_shared_dataset_survives_one_owner_moving_on() {
        let store = InMemoryDatasetStore::new();
        let first = two_output_node();
        let mut twin = virtual_node(&operator_node(4, "twin", "detect", vec![]));
        twin.outputs = first.outputs.clone();

        let shared = resolve_output_datasets(&store, &first, "h1", true).unwrap();
        let boxes = shared.get("boxes").unwrap().id;
        resolve_output_datasets(&store, &twin, "h1", false).unwrap();

        resolve_output_datasets(&store, &first, "h2", true).unwrap();
        assert!(store.get(boxes).is_some());
        assert_eq!(store.refs_of(&GraphId::operator(4)).len(), 2);
    }

    #[test]
    fn test_computed_keys_intersects_outputs() {
        let store = InMemoryDatasetStore::new();
        let outputs = resolve_output_datasets(&store, &two_output_node(), "h1", true).unwrap();
        let boxes = outputs.get("boxes").unwrap().id;
        let crops = outputs.get("crops").unwrap().id;
        for key in ["a", "b", "c"] {
            store.add_item(boxes, Item::new(key)).unwrap();
        }
        for key in ["b", "c", "d"] {
            store.add_item(crops, Item::new(key)).unwrap();
        }

        let keys = computed_keys(&store, &outputs).unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
