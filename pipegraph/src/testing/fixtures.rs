//! Fixtures for graph and engine tests.

use crate::catalog::{InputSpec, OperatorNode, OutputSpec, ParentRef};
use crate::config::EngineConfig;
use crate::datasets::{output_hash_key, Dataset, DatasetKind, Item};
use crate::engine::Engine;
use crate::errors::{PipegraphError, Result};
use crate::events::CollectingEventSink;
use crate::graph::{GraphId, GraphNode, GraphSource, Node, VirtualNode, VirtualParent};
use crate::operators::Operator;
use std::collections::HashMap;
use std::sync::Arc;

use super::ExecutionLog;

/// A configured node with one input per parent list and a single
/// `output` of type `table`.
///
/// Inputs are named `input`, `input1`, `input2`, ...
#[must_use]
pub fn operator_node(id: i64, name: &str, op: &str, parents: Vec<Vec<ParentRef>>) -> OperatorNode {
    let inputs = (0..parents.len())
        .map(|i| match i {
            0 => InputSpec::new("input"),
            i => InputSpec::new(format!("input{i}")),
        })
        .collect();
    let mut node = OperatorNode::new(name, op)
        .with_inputs(inputs)
        .with_outputs(vec![OutputSpec::new("output", "table")])
        .with_parents(parents);
    node.id = id;
    node
}

/// Virtualizes a configured node without a catalog. Edge data types are
/// left empty.
#[must_use]
pub fn virtual_node(node: &OperatorNode) -> VirtualNode {
    let parents = node
        .parents_by_input()
        .into_iter()
        .map(|(input, refs)| {
            let plist = refs
                .iter()
                .map(|parent| match parent {
                    ParentRef::Operator { id, output } => {
                        VirtualParent::operator(GraphId::operator(*id), output.clone(), "")
                    }
                    ParentRef::Dataset { id } => VirtualParent::dataset(*id, ""),
                })
                .collect();
            (input.name.clone(), plist)
        })
        .collect();

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

/// A raw `image` dataset record.
#[must_use]
pub fn dataset(id: i64, name: &str) -> Dataset {
    Dataset {
        id,
        name: name.to_string(),
        kind: DatasetKind::Data,
        data_type: "image".to_string(),
        hash: None,
        done: true,
    }
}

/// A [`GraphSource`] over a fixed set of nodes.
#[derive(Debug, Default)]
pub struct MapSource {
    nodes: HashMap<GraphId, GraphNode>,
}

impl MapSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node under its own id.
    pub fn add(&mut self, node: impl Into<GraphNode>) {
        let node = node.into();
        self.nodes.insert(node.graph_id(), node);
    }
}

impl GraphSource for MapSource {
    fn fetch(&self, id: &GraphId) -> Result<GraphNode> {
        self.nodes.get(id).cloned().ok_or_else(|| {
            let kind = if id.is_operator() { "node" } else { "dataset" };
            PipegraphError::not_found(kind, id)
        })
    }
}

/// An engine running tasks in-process, with a shared execution log and a
/// collecting event sink.
pub struct TestEngine {
    /// The engine under test.
    pub engine: Engine,
    /// Tasks executed by operators created through [`TestEngine::recording`].
    pub log: ExecutionLog,
    /// Every event the engine emitted.
    pub events: Arc<CollectingEventSink>,
}

impl TestEngine {
    /// Creates a harness with two-way container parallelism.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default().with_default_parallelism(2))
    }

    /// Creates a harness with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let events = Arc::new(CollectingEventSink::new());
        let engine = Engine::builder().config(config).events(events.clone()).build()?;
        Ok(Self {
            engine,
            log: ExecutionLog::new(),
            events,
        })
    }

    /// Registers an operator.
    ///
    /// # Errors
    ///
    /// Fails if the id is taken.
    pub fn register(&self, operator: impl Operator + 'static) -> Result<()> {
        self.engine.register_operator(Arc::new(operator))
    }

    /// Registers a [`RecordingOperator`](super::RecordingOperator) logging
    /// into [`TestEngine::log`].
    ///
    /// # Errors
    ///
    /// Fails if the id is taken.
    pub fn recording(&self, id: &str, incremental: bool) -> Result<()> {
        let mut op = super::RecordingOperator::new(id).with_log(self.log.clone());
        if incremental {
            op = op.incremental();
        }
        self.register(op)
    }

    /// Creates a raw dataset holding one item per key.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn raw_dataset<I, K>(&self, name: &str, keys: I) -> Result<Dataset>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let store = self.engine.datasets();
        let ds = store.create_dataset(name, DatasetKind::Data, "image", None);
        for key in keys {
            store.add_item(ds.id, Item::new(key))?;
        }
        store.set_done(ds.id, true)?;
        Ok(ds)
    }

    /// Creates a node reading `parents`, one input per list.
    ///
    /// # Errors
    ///
    /// Fails for unknown operators or parents.
    pub fn add_node(
        &self,
        name: &str,
        op: &str,
        parents: Vec<Vec<ParentRef>>,
    ) -> Result<OperatorNode> {
        self.engine
            .create_node(OperatorNode::new(name, op).with_parents(parents))
    }

    /// The dataset holding `output` of a node at its current hash.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be hashed.
    pub fn output_dataset(&self, node_id: i64, output: &str) -> Result<Option<Dataset>> {
        let hash = self.engine.node_hash(node_id)?;
        Ok(self.engine.datasets().find_by_hash(&output_hash_key(&hash, output)))
    }

    /// Sorted keys stored in a node's `output` dataset.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be hashed.
    pub fn output_keys(&self, node_id: i64) -> Result<Vec<String>> {
        let Some(ds) = self.output_dataset(node_id, "output")? else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<String> = self
            .engine
            .datasets()
            .list_items(ds.id)?
            .into_iter()
            .map(|item| item.key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Whether a node's `output` dataset is done.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be hashed.
    pub fn output_done(&self, node_id: i64) -> Result<bool> {
        Ok(self.output_dataset(node_id, "output")?.is_some_and(|ds| ds.done))
    }
}

impl std::fmt::Debug for TestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEngine").field("engine", &self.engine).finish_non_exhaustive()
    }
}
