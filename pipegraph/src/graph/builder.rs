//! Expansion of a root node into its transitive execution graph.

use super::{ExecutionGraph, GraphId, GraphNode, Node};
use crate::errors::{PipegraphError, Result, SchedulingError};
use std::collections::VecDeque;
use tracing::debug;

/// Supplies graph nodes for ids that are not yet part of a graph.
///
/// Only non-virtual ids are ever fetched; virtual nodes exist solely inside
/// the graph that resolution added them to.
pub trait GraphSource: Send + Sync {
    /// Loads the node for `id`.
    ///
    /// # Errors
    ///
    /// Returns a configuration or not-found error when the id refers to a
    /// node or dataset that does not exist.
    fn fetch(&self, id: &GraphId) -> Result<GraphNode>;
}

/// Builds and grows execution graphs from a [`GraphSource`].
pub struct GraphBuilder<'a> {
    source: &'a dyn GraphSource,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder over the given source.
    #[must_use]
    pub fn new(source: &'a dyn GraphSource) -> Self {
        Self { source }
    }

    /// Returns the graph containing `root` and all of its ancestors.
    ///
    /// # Errors
    ///
    /// Fails if any ancestor cannot be fetched.
    pub fn build_graph(&self, root: &GraphId) -> Result<ExecutionGraph> {
        let mut graph = ExecutionGraph::new();
        let node = self.source.fetch(root)?;
        graph.insert(node);
        self.close_over_parents(&mut graph, vec![root.clone()])?;
        debug!(root = %root, nodes = graph.len(), "built execution graph");
        Ok(graph)
    }

    /// Merges `subgraph` into `graph` and fetches any missing ancestors.
    ///
    /// Ids already present are overwritten with the subgraph's node. Returns
    /// the ids that were not in `graph` before, sorted.
    ///
    /// # Errors
    ///
    /// Fails if an ancestor cannot be fetched, or if a node points at a
    /// virtual parent that neither graph contains.
    pub fn incorporate_subgraph(
        &self,
        graph: &mut ExecutionGraph,
        subgraph: ExecutionGraph,
    ) -> Result<Vec<GraphId>> {
        let before: Vec<GraphId> = graph.ids();
        let seeds = subgraph.ids();
        for (_, node) in subgraph {
            graph.insert(node);
        }
        self.close_over_parents(graph, seeds)?;

        let added: Vec<GraphId> = graph
            .ids()
            .into_iter()
            .filter(|id| before.binary_search(id).is_err())
            .collect();
        debug!(added = added.len(), nodes = graph.len(), "incorporated subgraph");
        Ok(added)
    }

    fn close_over_parents(&self, graph: &mut ExecutionGraph, seeds: Vec<GraphId>) -> Result<()> {
        let mut queue: VecDeque<GraphId> = seeds.into();

        while let Some(id) = queue.pop_front() {
            let parents = match graph.get(&id) {
                Some(node) => node.graph_parents(),
                None => continue,
            };
            for parent in parents.into_values() {
                if graph.contains(&parent) {
                    continue;
                }
                if parent.is_virtual() {
                    return Err(PipegraphError::from(SchedulingError::DanglingVirtualParent {
                        node: graph.display_name(&id),
                        parent: parent.to_string(),
                    }));
                }
                let node = self.source.fetch(&parent)?;
                graph.insert(node);
                queue.push_back(parent);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ParentRef;
    use crate::graph::VirtualParent;
    use crate::testing::fixtures::{dataset, operator_node, virtual_node, MapSource};
    use pretty_assertions::assert_eq;

    fn source() -> MapSource {
        let mut source = MapSource::new();
        source.add(dataset(1, "raw"));
        source.add(virtual_node(&operator_node(
            10,
            "a",
            "resize",
            vec![vec![ParentRef::dataset(1)]],
        )));
        source.add(virtual_node(&operator_node(
            11,
            "b",
            "resize",
            vec![vec![ParentRef::operator(10, "output")]],
        )));
        source.add(virtual_node(&operator_node(
            12,
            "c",
            "resize",
            vec![vec![ParentRef::operator(11, "output"), ParentRef::dataset(1)]],
        )));
        source
    }

    #[test]
    fn test_build_graph_closes_over_ancestors() {
        let source = source();
        let graph = GraphBuilder::new(&source).build_graph(&GraphId::operator(12)).unwrap();
        assert_eq!(
            graph.ids(),
            vec![
                GraphId::operator(10),
                GraphId::operator(11),
                GraphId::operator(12),
                GraphId::dataset(1),
            ]
        );
    }

    #[test]
    fn test_build_graph_stops_at_root_ancestors() {
        let source = source();
        let graph = GraphBuilder::new(&source).build_graph(&GraphId::operator(10)).unwrap();
        assert_eq!(graph.ids(), vec![GraphId::operator(10), GraphId::dataset(1)]);
    }

    #[test]
    fn test_build_graph_missing_node() {
        let source = source();
        let err = GraphBuilder::new(&source)
            .build_graph(&GraphId::operator(404))
            .unwrap_err();
        assert!(matches!(err, PipegraphError::NotFound { .. }));
    }

    #[test]
    fn test_incorporate_subgraph_adds_and_overwrites() {
        let source = source();
        let builder = GraphBuilder::new(&source);
        let mut graph = builder.build_graph(&GraphId::operator(11)).unwrap();

        let orig = operator_node(11, "b", "resize", vec![]);
        let mut materialize =
            virtual_node(&operator_node(11, "b-materialize", "materialize", vec![]));
        materialize.virtual_key = "materialize-input-0".to_string();
        materialize.parents.insert(
            "inputs".to_string(),
            vec![VirtualParent::operator(GraphId::operator(10), "output", "")],
        );
        let mut replacement = virtual_node(&orig);
        replacement.parents.insert(
            "input".to_string(),
            vec![VirtualParent::operator(
                GraphId::virtual_operator(11, "materialize-input-0"),
                "outputs0",
                "",
            )],
        );

        let sub: ExecutionGraph =
            [GraphNode::from(materialize), GraphNode::from(replacement.clone())]
                .into_iter()
                .collect();
        let added = builder.incorporate_subgraph(&mut graph, sub.clone()).unwrap();
        assert_eq!(added, vec![GraphId::virtual_operator(11, "materialize-input-0")]);
        assert_eq!(graph.operator(&GraphId::operator(11)), Some(&replacement));

        let again = builder.incorporate_subgraph(&mut graph, sub).unwrap();
        assert!(again.is_empty());
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_incorporate_subgraph_fetches_new_ancestors() {
        let source = source();
        let builder = GraphBuilder::new(&source);
        let mut graph = ExecutionGraph::new();
        graph.insert(dataset(1, "raw"));

        let mut extra = virtual_node(&operator_node(20, "extra", "resize", vec![]));
        extra.parents.insert(
            "input".to_string(),
            vec![VirtualParent::operator(GraphId::operator(11), "output", "")],
        );
        let sub: ExecutionGraph = std::iter::once(GraphNode::from(extra)).collect();

        let added = builder.incorporate_subgraph(&mut graph, sub).unwrap();
        assert_eq!(
            added,
            vec![GraphId::operator(10), GraphId::operator(11), GraphId::operator(20)]
        );
    }

    #[test]
    fn test_dangling_virtual_parent() {
        let source = source();
        let builder = GraphBuilder::new(&source);
        let mut graph = builder.build_graph(&GraphId::operator(10)).unwrap();

        let mut node = virtual_node(&operator_node(10, "a", "resize", vec![]));
        node.parents.insert(
            "input".to_string(),
            vec![VirtualParent::operator(GraphId::virtual_operator(10, "gone"), "o", "")],
        );
        let sub: ExecutionGraph = std::iter::once(GraphNode::from(node)).collect();

        let err = builder.incorporate_subgraph(&mut graph, sub).unwrap_err();
        match err {
            PipegraphError::Scheduling(e) => assert_eq!(e.code(), "GRAPH-DANGLING-VIRTUAL"),
            other => panic!("unexpected error {other}"),
        }
    }
}
