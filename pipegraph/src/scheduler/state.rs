//! Per-run node status bookkeeping.

use crate::datasets::{resolve_output_datasets, DatasetStore};
use crate::errors::{Result, SchedulingError};
use crate::graph::{
    compute_hashes, ExecutionGraph, GraphBuilder, GraphId, GraphNode, GraphSource, Node,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

/// The graph of one run and the status of each of its nodes.
///
/// Every node is either ready or missing. `needed` is the part of `missing`
/// the target transitively depends on through missing nodes. The sets are
/// private to one run and need no locking.
#[derive(Debug, Clone)]
pub struct RunState {
    graph: ExecutionGraph,
    hashes: HashMap<GraphId, String>,
    target: GraphId,
    force: bool,
    ready: HashSet<GraphId>,
    missing: HashSet<GraphId>,
    needed: HashSet<GraphId>,
    resolutions: HashMap<GraphId, usize>,
}

impl RunState {
    /// Hashes and classifies `graph` for a run of `target`.
    ///
    /// With `force` the target starts out missing even if its outputs are
    /// done.
    ///
    /// # Errors
    ///
    /// Returns a scheduling error if the graph cannot be hashed.
    pub fn new(
        store: &dyn DatasetStore,
        graph: ExecutionGraph,
        target: GraphId,
        force: bool,
    ) -> Result<Self> {
        let hashes = compute_hashes(&graph, &HashMap::new())?;
        let mut state = Self {
            graph,
            hashes,
            target,
            force,
            ready: HashSet::new(),
            missing: HashSet::new(),
            needed: HashSet::new(),
            resolutions: HashMap::new(),
        };
        state.classify(store, state.graph.ids())?;
        if force {
            state.ready.remove(&state.target);
            state.missing.insert(state.target.clone());
        }
        state.compute_needed();
        Ok(state)
    }

    /// The run's graph.
    #[must_use]
    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Content hashes of every node in the graph.
    #[must_use]
    pub fn hashes(&self) -> &HashMap<GraphId, String> {
        &self.hashes
    }

    /// Hash of one node.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulingError::MissingHash`] for ids outside the graph.
    pub fn hash(&self, id: &GraphId) -> Result<&str, SchedulingError> {
        self.hashes
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| SchedulingError::MissingHash(id.to_string()))
    }

    /// The node the run drives to completion.
    #[must_use]
    pub fn target(&self) -> &GraphId {
        &self.target
    }

    /// Whether the target's outputs are cleared and recomputed.
    #[must_use]
    pub fn forces(&self, id: &GraphId) -> bool {
        self.force && *id == self.target
    }

    /// Makes `target` the node the run drives, recomputing `needed`.
    pub fn retarget(&mut self, target: GraphId) {
        self.target = target;
        self.compute_needed();
    }

    /// Returns true if the node's outputs are available.
    #[must_use]
    pub fn is_ready(&self, id: &GraphId) -> bool {
        self.ready.contains(id)
    }

    /// Returns true if the node is in the graph but not ready.
    #[must_use]
    pub fn is_missing(&self, id: &GraphId) -> bool {
        self.missing.contains(id)
    }

    /// Returns true if the target transitively needs the node.
    #[must_use]
    pub fn is_needed(&self, id: &GraphId) -> bool {
        self.needed.contains(id)
    }

    /// Number of needed nodes.
    #[must_use]
    pub fn needed_len(&self) -> usize {
        self.needed.len()
    }

    /// Display names of needed nodes, sorted.
    #[must_use]
    pub fn needed_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.needed.iter().map(|id| self.graph.display_name(id)).collect();
        names.sort();
        names
    }

    /// Distinct operator node ids among the needed nodes, sorted.
    #[must_use]
    pub fn needed_node_ids(&self) -> Vec<i64> {
        self.needed
            .iter()
            .filter(|id| id.is_operator())
            .map(|id| id.id)
            .collect::<BTreeSet<i64>>()
            .into_iter()
            .collect()
    }

    /// Needed nodes whose parents are all ready, sorted.
    #[must_use]
    pub fn candidates(&self) -> Vec<GraphId> {
        let mut ids: Vec<GraphId> = self
            .needed
            .iter()
            .filter(|id| {
                self.graph.get(id).is_some_and(|node| {
                    node.graph_parents().values().all(|p| self.ready.contains(p))
                })
            })
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Moves a node to `ready`.
    pub fn mark_ready(&mut self, id: &GraphId) {
        self.missing.remove(id);
        self.needed.remove(id);
        self.ready.insert(id.clone());
    }

    /// Counts a resolution of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulingError::ResolutionLoop`] once the node has been
    /// resolved more than `max` times.
    pub fn record_resolution(&mut self, id: &GraphId, max: usize) -> Result<(), SchedulingError> {
        let count = self.resolutions.entry(id.clone()).or_insert(0);
        *count += 1;
        if *count > max {
            return Err(SchedulingError::resolution_loop(self.graph.display_name(id), *count));
        }
        Ok(())
    }

    /// Merges a resolution subgraph and re-propagates readiness.
    ///
    /// Nodes already in the graph keep their hashes; only new ids are hashed
    /// and classified. Returns the new ids.
    ///
    /// # Errors
    ///
    /// Fails if the subgraph's ancestors cannot be fetched or hashed.
    pub fn incorporate(
        &mut self,
        source: &dyn GraphSource,
        store: &dyn DatasetStore,
        subgraph: ExecutionGraph,
    ) -> Result<Vec<GraphId>> {
        let added = GraphBuilder::new(source).incorporate_subgraph(&mut self.graph, subgraph)?;
        self.hashes = compute_hashes(&self.graph, &self.hashes)?;
        self.classify(store, added.iter().cloned())?;
        self.compute_needed();
        debug!(added = added.len(), needed = self.needed.len(), "incorporated resolution");
        Ok(added)
    }

    /// Sorts nodes into ready and missing.
    ///
    /// An operator node takes a reference on every output dataset matching
    /// its hash, done or not, so a dataset shared by content-identical nodes
    /// outlives any one of them.
    fn classify(
        &mut self,
        store: &dyn DatasetStore,
        ids: impl IntoIterator<Item = GraphId>,
    ) -> Result<()> {
        for id in ids {
            let ready = match self.graph.get(&id) {
                Some(GraphNode::Dataset(_)) => true,
                Some(GraphNode::Operator(node)) => match self.hashes.get(&id) {
                    Some(hash) => resolve_output_datasets(store, node, hash, false)?.all_done(),
                    None => false,
                },
                None => continue,
            };
            if ready {
                self.ready.insert(id);
            } else {
                self.missing.insert(id);
            }
        }
        Ok(())
    }

    /// Recomputes `needed` by walking missing parents back from the target.
    fn compute_needed(&mut self) {
        self.needed.clear();
        if !self.missing.contains(&self.target) {
            return;
        }
        let mut queue = VecDeque::from([self.target.clone()]);
        self.needed.insert(self.target.clone());
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.graph.get(&id) else {
                continue;
            };
            for parent in node.graph_parents().into_values() {
                if self.missing.contains(&parent) && self.needed.insert(parent.clone()) {
                    queue.push_back(parent);
                }
            }
        }
    }
}
