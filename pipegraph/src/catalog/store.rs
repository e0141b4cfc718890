//! In-memory catalog of configured operator nodes.

use super::{NodeUpdate, OperatorNode};
use crate::errors::{PipegraphError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<i64, OperatorNode>,
    next_id: i64,
}

/// Stores configured operator nodes and keeps parent edges consistent.
///
/// Removing a node, or removing outputs from it, prunes every edge that
/// pointed at what was removed.
#[derive(Debug, Default)]
pub struct NodeStore {
    inner: RwLock<Inner>,
}

impl NodeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Saves a new node, assigning it an id.
    pub fn create(&self, mut node: OperatorNode) -> OperatorNode {
        let mut inner = self.inner.write();
        inner.next_id += 1;
        node.id = inner.next_id;
        node.normalize_parents();
        inner.nodes.insert(node.id, node.clone());
        debug!(node_id = node.id, name = %node.name, op = %node.op, "created operator node");
        node
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn get(&self, id: i64) -> Option<OperatorNode> {
        self.inner.read().nodes.get(&id).cloned()
    }

    /// Returns every node, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<OperatorNode> {
        self.inner.read().nodes.values().cloned().collect()
    }

    /// Returns the nodes of one workspace, ordered by id.
    #[must_use]
    pub fn list_workspace(&self, workspace: &str) -> Vec<OperatorNode> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| n.workspace == workspace)
            .cloned()
            .collect()
    }

    /// Returns the ids of nodes that read from `id`.
    #[must_use]
    pub fn dependents(&self, id: i64) -> Vec<i64> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| n.references(id))
            .map(|n| n.id)
            .collect()
    }

    /// Applies a partial update.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the node does not exist.
    pub fn update(&self, id: i64, update: NodeUpdate) -> Result<OperatorNode> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| PipegraphError::not_found("node", id))?;

        if let Some(name) = update.name {
            node.name = name;
        }
        if let Some(op) = update.op {
            node.op = op;
        }
        if let Some(params) = update.params {
            node.params = params;
        }
        if let Some(inputs) = update.inputs {
            node.inputs = inputs;
        }
        if let Some(parents) = update.parents {
            node.parents = parents;
        }
        let new_outputs = update.outputs.filter(|outputs| *outputs != node.outputs);
        if let Some(outputs) = &new_outputs {
            node.outputs.clone_from(outputs);
        }
        node.normalize_parents();
        let updated = node.clone();

        if let Some(outputs) = new_outputs {
            let keep: Vec<String> = outputs.into_iter().map(|o| o.name).collect();
            Self::prune_references(&mut inner, id, &keep);
        }
        Ok(updated)
    }

    /// Deletes a node and prunes every edge that pointed at it.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the node does not exist.
    pub fn delete(&self, id: i64) -> Result<OperatorNode> {
        let mut inner = self.inner.write();
        let removed = inner
            .nodes
            .remove(&id)
            .ok_or_else(|| PipegraphError::not_found("node", id))?;
        Self::prune_references(&mut inner, id, &[]);
        info!(node_id = id, name = %removed.name, "deleted operator node");
        Ok(removed)
    }

    fn prune_references(inner: &mut Inner, id: i64, keep: &[String]) {
        for other in inner.nodes.values_mut() {
            if other.prune_parents(id, keep) {
                debug!(node_id = other.id, parent_id = id, "pruned broken parent references");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InputSpec, OutputSpec, ParentRef};
    use pretty_assertions::assert_eq;

    fn store_with_chain() -> (NodeStore, OperatorNode, OperatorNode) {
        let store = NodeStore::new();
        let a = store.create(
            OperatorNode::new("a", "resize")
                .with_outputs(vec![
                    OutputSpec::new("output", "image"),
                    OutputSpec::new("thumbs", "image"),
                ])
                .with_workspace("default"),
        );
        let b = store.create(
            OperatorNode::new("b", "detect")
                .with_inputs(vec![InputSpec::new("input"), InputSpec::new("extra")])
                .with_parents(vec![
                    vec![ParentRef::operator(a.id, "output"), ParentRef::dataset(7)],
                    vec![ParentRef::operator(a.id, "thumbs")],
                ])
                .with_workspace("other"),
        );
        (store, a, b)
    }

    #[test]
    fn test_create_assigns_ids_and_pads_parents() {
        let store = NodeStore::new();
        let node =
            store.create(OperatorNode::new("n", "op").with_inputs(vec![InputSpec::new("x")]));
        assert_eq!(node.id, 1);
        assert_eq!(node.parents.len(), 1);
        assert_eq!(store.create(OperatorNode::new("m", "op")).id, 2);
    }

    #[test]
    fn test_list_workspace() {
        let (store, a, b) = store_with_chain();
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.list_workspace("default"), vec![a]);
        assert_eq!(store.list_workspace("other"), vec![b]);
    }

    #[test]
    fn test_delete_prunes_dependents() {
        let (store, a, b) = store_with_chain();
        assert_eq!(store.dependents(a.id), vec![b.id]);

        store.delete(a.id).unwrap();
        let b = store.get(b.id).unwrap();
        assert_eq!(b.parents, vec![vec![ParentRef::dataset(7)], vec![]]);
        assert!(store.get(a.id).is_none());
        assert!(store.dependents(a.id).is_empty());
    }

    #[test]
    fn test_removing_output_prunes_only_that_edge() {
        let (store, a, b) = store_with_chain();
        store
            .update(a.id, NodeUpdate::new().with_outputs(vec![OutputSpec::new("output", "image")]))
            .unwrap();

        let b = store.get(b.id).unwrap();
        assert_eq!(
            b.parents,
            vec![vec![ParentRef::operator(a.id, "output"), ParentRef::dataset(7)], vec![]]
        );
    }

    #[test]
    fn test_update_params() {
        let (store, a, _) = store_with_chain();
        let updated = store.update(a.id, NodeUpdate::new().with_params("{\"w\":1}")).unwrap();
        assert_eq!(updated.params, "{\"w\":1}");
        assert_eq!(store.get(a.id).unwrap().params, "{\"w\":1}");
    }

    #[test]
    fn test_missing_node() {
        let store = NodeStore::new();
        assert!(matches!(store.delete(9), Err(PipegraphError::NotFound { .. })));
        assert!(store.update(9, NodeUpdate::new()).is_err());
    }
}
