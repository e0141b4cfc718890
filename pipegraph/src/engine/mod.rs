//! The engine service object.
//!
//! An [`Engine`] owns every process-wide resource (catalog, dataset store,
//! operator registry, job registry, worker pool, event sink) and is shared
//! by reference with every run. Separate engines share nothing, which keeps
//! tests isolated.

mod context;

pub use context::EngineContext;

use crate::cancellation::CancellationToken;
use crate::catalog::{NodeStore, NodeUpdate, OperatorNode};
use crate::config::EngineConfig;
use crate::datasets::{resolve_output_datasets, DatasetStore, InMemoryDatasetStore};
use crate::errors::{ConfigurationError, PipegraphError, Result};
use crate::events::{EngineEvent, EventSink, NoOpEventSink};
#[cfg(feature = "http")]
use crate::exec::HttpWorkerBackend;
use crate::exec::{LocalWorkerBackend, TaskExecutor, WorkerBackend, WorkerPool};
use crate::graph::{compute_hashes, ExecutionGraph, GraphBuilder, GraphId};
use crate::jobs::{
    ConflictGuard, InMemoryJobStore, Job, JobHandle, JobRegistry, JobStore, JobUpdate, RunJobOp,
    JOB_TYPE_MULTIEXEC,
};
use crate::operators::{Operator, OperatorRegistry};
use crate::scheduler::{IncrementalSummary, RunOptions, RunSummary, Scheduler, WantedKeys};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Builder for [`Engine`].
///
/// Every collaborator defaults to its in-memory implementation. Without an
/// explicit backend, tasks go to the HTTP worker when `worker_url` is set and
/// run in-process otherwise.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    catalog: Option<Arc<NodeStore>>,
    datasets: Option<Arc<dyn DatasetStore>>,
    operators: Option<Arc<OperatorRegistry>>,
    job_store: Option<Arc<dyn JobStore>>,
    backend: Option<Arc<dyn WorkerBackend>>,
    events: Option<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an existing node catalog.
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<NodeStore>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Uses an existing dataset store.
    #[must_use]
    pub fn datasets(mut self, datasets: Arc<dyn DatasetStore>) -> Self {
        self.datasets = Some(datasets);
        self
    }

    /// Uses an existing operator registry.
    #[must_use]
    pub fn operators(mut self, operators: Arc<OperatorRegistry>) -> Self {
        self.operators = Some(operators);
        self
    }

    /// Uses an existing job store.
    #[must_use]
    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Dispatches tasks through `backend`.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn WorkerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sends run events to `events`.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings, or a transport
    /// error if the HTTP client cannot be built.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let catalog = self.catalog.unwrap_or_default();
        let datasets = self
            .datasets
            .unwrap_or_else(|| Arc::new(InMemoryDatasetStore::new()));
        let operators = self
            .operators
            .unwrap_or_else(|| Arc::new(OperatorRegistry::with_builtins()));
        let job_store = self.job_store.unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(NoOpEventSink));
        let backend = match self.backend {
            Some(backend) => backend,
            None => default_backend(&config, &operators, &datasets)?,
        };

        let jobs = Arc::new(JobRegistry::new(job_store, config.job_state_interval()));
        let executor = TaskExecutor::new(
            backend,
            WorkerPool::new(config.worker_slots),
            jobs.clone(),
            datasets.clone(),
            events.clone(),
        )
        .with_coordinator_url(config.coordinator_url.clone())
        .with_default_parallelism(config.default_parallelism)
        .with_tail_lines(config.tail_lines);

        info!(
            worker_slots = config.worker_slots,
            remote = config.worker_url.is_some(),
            "engine initialized"
        );
        Ok(Engine {
            ctx: Arc::new(EngineContext {
                config,
                catalog,
                datasets,
                operators,
                jobs,
                executor,
                events,
                conflicts: ConflictGuard::new(),
            }),
        })
    }
}

fn default_backend(
    config: &EngineConfig,
    operators: &Arc<OperatorRegistry>,
    datasets: &Arc<dyn DatasetStore>,
) -> Result<Arc<dyn WorkerBackend>> {
    #[cfg(feature = "http")]
    {
        if let Some(http) = HttpWorkerBackend::from_config(config)? {
            return Ok(Arc::new(http));
        }
    }
    #[cfg(not(feature = "http"))]
    {
        if config.worker_url.is_some() {
            return Err(PipegraphError::config("worker_url requires the http feature"));
        }
    }
    Ok(Arc::new(LocalWorkerBackend::new(operators.clone(), datasets.clone())))
}

/// A run started in the background.
#[derive(Debug)]
pub struct RunHandle {
    job_id: i64,
    task: JoinHandle<Result<RunSummary>>,
}

impl RunHandle {
    /// Id of the run's `multiexec` job.
    #[must_use]
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Waits for the run to finish.
    ///
    /// # Errors
    ///
    /// Returns the run's error, or an internal error if the task panicked.
    pub async fn join(self) -> Result<RunSummary> {
        self.task
            .await
            .map_err(|e| PipegraphError::Internal(format!("run task failed: {e}")))?
    }
}

/// The execution engine.
#[derive(Debug, Clone)]
pub struct Engine {
    ctx: Arc<EngineContext>,
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Creates an engine with in-memory stores.
    ///
    /// # Errors
    ///
    /// See [`EngineBuilder::build`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new().config(config).build()
    }

    /// Shared services.
    #[must_use]
    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// The node catalog.
    #[must_use]
    pub fn catalog(&self) -> &NodeStore {
        &self.ctx.catalog
    }

    /// The dataset store.
    #[must_use]
    pub fn datasets(&self) -> &Arc<dyn DatasetStore> {
        &self.ctx.datasets
    }

    /// The job registry.
    #[must_use]
    pub fn jobs(&self) -> &JobRegistry {
        &self.ctx.jobs
    }

    /// Registers an operator type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is taken.
    pub fn register_operator(&self, operator: Arc<dyn Operator>) -> Result<()> {
        self.ctx.operators.register(operator)
    }

    /// Saves a new configured node.
    ///
    /// Inputs and outputs left empty are filled in from the operator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown operators or parents.
    pub fn create_node(&self, mut node: OperatorNode) -> Result<OperatorNode> {
        let operator = self.ctx.operators.get(&node.op)?;
        if node.inputs.is_empty() {
            node.inputs = operator.inputs(&node.params);
        }
        if node.outputs.is_empty() {
            let input_types = self.input_types(&node)?;
            node.outputs = operator.outputs(&node.params, &input_types);
        }
        Ok(self.ctx.catalog.create(node))
    }

    /// Applies a partial update to a configured node.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown operators, or not-found for
    /// unknown nodes.
    pub fn update_node(&self, id: i64, update: NodeUpdate) -> Result<OperatorNode> {
        if let Some(op) = &update.op {
            self.ctx.operators.get(op)?;
        }
        self.ctx.catalog.update(id, update)
    }

    /// Deletes a configured node, pruning edges to it and dropping its
    /// dataset references.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown nodes.
    pub fn delete_node(&self, id: i64) -> Result<OperatorNode> {
        let removed = self.ctx.catalog.delete(id)?;
        let released = self.ctx.datasets.remove_node_refs(id);
        info!(node_id = id, released, "node references released");
        Ok(removed)
    }

    /// Expands a configured node into its execution graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration or not-found error if an ancestor is invalid.
    pub fn build_graph(&self, node_id: i64) -> Result<ExecutionGraph> {
        GraphBuilder::new(self.ctx.as_ref()).build_graph(&GraphId::operator(node_id))
    }

    /// Content hash of a configured node.
    ///
    /// # Errors
    ///
    /// Fails if the graph cannot be built or hashed.
    pub fn node_hash(&self, node_id: i64) -> Result<String> {
        let target = GraphId::operator(node_id);
        let graph = self.build_graph(node_id)?;
        let mut hashes = compute_hashes(&graph, &HashMap::new())?;
        hashes
            .remove(&target)
            .ok_or_else(|| PipegraphError::Internal(format!("no hash computed for {target}")))
    }

    /// Marks a node's current outputs done without executing it.
    ///
    /// # Errors
    ///
    /// Fails if the graph cannot be built or hashed.
    pub fn mark_done(&self, node_id: i64) -> Result<()> {
        let target = GraphId::operator(node_id);
        let graph = self.build_graph(node_id)?;
        let hashes = compute_hashes(&graph, &HashMap::new())?;
        let node = graph
            .operator(&target)
            .ok_or_else(|| PipegraphError::not_found("node", node_id))?;
        let hash = hashes
            .get(&target)
            .ok_or_else(|| PipegraphError::Internal(format!("no hash computed for {target}")))?;

        let outputs = resolve_output_datasets(self.ctx.datasets.as_ref(), node, hash, true)?;
        for ds in outputs.existing() {
            self.ctx.datasets.set_done(ds.id, true)?;
        }
        info!(node = %node.name, "outputs marked done");
        Ok(())
    }

    /// Runs a node and every needed ancestor to completion.
    ///
    /// Configuration errors are returned before a job is created. Every
    /// other outcome ends the run's `multiexec` job.
    ///
    /// # Errors
    ///
    /// Returns the run's configuration, scheduling, conflict or task error.
    pub async fn run_node(&self, node_id: i64, options: RunOptions) -> Result<RunSummary> {
        let (graph, job) = self.start_run(node_id, "Run")?;
        run_job(self.ctx.clone(), job, graph, GraphId::operator(node_id), options).await
    }

    /// Starts a run in the background and returns once its job exists.
    ///
    /// # Errors
    ///
    /// Returns configuration errors synchronously.
    pub fn spawn_run_node(&self, node_id: i64, options: RunOptions) -> Result<RunHandle> {
        let (graph, job) = self.start_run(node_id, "Run")?;
        let job_id = job.id();
        let task = tokio::spawn(run_job(
            self.ctx.clone(),
            job,
            graph,
            GraphId::operator(node_id),
            options,
        ));
        Ok(RunHandle { job_id, task })
    }

    /// Produces `wanted` keys at an incremental node.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the node is not incremental, or the
    /// run's scheduling, conflict or task error.
    pub async fn incremental(
        &self,
        node_id: i64,
        wanted: WantedKeys,
    ) -> Result<IncrementalSummary> {
        let node = self
            .ctx
            .catalog
            .get(node_id)
            .ok_or_else(|| PipegraphError::not_found("node", node_id))?;
        if !self.ctx.operators.get(&node.op)?.is_incremental() {
            return Err(ConfigurationError::new("can only incrementally run incremental nodes")
                .with_node(node.name)
                .into());
        }

        let (graph, job) = self.start_run(node_id, "Incremental")?;
        let ctx = self.ctx.as_ref();
        ctx.events.try_emit(
            EngineEvent::RunStarted,
            Some(json!({"job_id": job.id(), "node": node.name, "mode": "incremental"})),
        );
        let result = Scheduler::new(ctx, &job)
            .incremental(graph, GraphId::operator(node_id), &wanted)
            .await;
        let result = match result {
            Err(PipegraphError::Stopped(_)) => Ok(IncrementalSummary {
                stopped: true,
                ..IncrementalSummary::default()
            }),
            other => other,
        };
        finish_run(ctx, &job, &node.name, result.as_ref().map(|s| s.stopped));
        result
    }

    /// Stops a job and waits until it is done.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown jobs, or an internal error if the job
    /// does not finish within the configured stop timeout.
    pub async fn stop_job(&self, job_id: i64) -> Result<()> {
        info!(job_id, "stop requested");
        self.ctx.jobs.stop(job_id, self.ctx.config.stop_timeout()).await
    }

    /// Looks up a job record.
    #[must_use]
    pub fn job(&self, job_id: i64) -> Option<Job> {
        self.ctx.jobs.job(job_id)
    }

    /// Appends worker console output to a running job.
    ///
    /// # Errors
    ///
    /// Returns not-found if the job is not running.
    pub fn apply_job_update(&self, update: &JobUpdate) -> Result<()> {
        self.ctx.jobs.apply_update(update)
    }

    fn input_types(&self, node: &OperatorNode) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self
            .ctx
            .virtual_parents(node)?
            .into_iter()
            .map(|(name, parents)| (name, parents.into_iter().map(|p| p.data_type).collect()))
            .collect())
    }

    /// Builds the graph, then creates the run's job.
    fn start_run(&self, node_id: i64, kind: &str) -> Result<(ExecutionGraph, Arc<JobHandle>)> {
        let graph = self.build_graph(node_id)?;
        let name = graph.display_name(&GraphId::operator(node_id));
        let job = self.ctx.jobs.start(
            &format!("{kind} {name}"),
            JOB_TYPE_MULTIEXEC,
            Box::new(RunJobOp::new(self.ctx.config.tail_lines)),
            Arc::new(CancellationToken::new()),
        );
        Ok((graph, job))
    }
}

async fn run_job(
    ctx: Arc<EngineContext>,
    job: Arc<JobHandle>,
    graph: ExecutionGraph,
    target: GraphId,
    options: RunOptions,
) -> Result<RunSummary> {
    let name = graph.display_name(&target);
    ctx.events.try_emit(
        EngineEvent::RunStarted,
        Some(json!({"job_id": job.id(), "node": name, "force": options.force})),
    );
    let result = Scheduler::new(&ctx, &job).run(graph, target, options).await;
    let result = match result {
        Err(PipegraphError::Stopped(_)) => Ok(RunSummary {
            stopped: true,
            ..RunSummary::default()
        }),
        other => other,
    };
    finish_run(&ctx, &job, &name, result.as_ref().map(|s| s.stopped));
    result
}

/// Emits the terminal run event and ends the job. A stop is not an error.
fn finish_run(
    ctx: &EngineContext,
    job: &JobHandle,
    node: &str,
    outcome: std::result::Result<bool, &PipegraphError>,
) {
    let data = |extra: serde_json::Value| {
        let mut data = json!({"job_id": job.id(), "node": node});
        if let (Some(data), Some(extra)) = (data.as_object_mut(), extra.as_object()) {
            data.extend(extra.clone());
        }
        Some(data)
    };
    match outcome {
        Ok(false) => {
            ctx.events.try_emit(EngineEvent::RunCompleted, data(json!({})));
            ctx.jobs.finish(job, None);
        }
        Ok(true) => {
            ctx.events.try_emit(EngineEvent::RunStopped, data(json!({})));
            ctx.jobs.finish(job, None);
        }
        Err(err) => {
            warn!(job_id = job.id(), node, error = %err, kind = %err.kind(), "run failed");
            ctx.events.try_emit(
                EngineEvent::RunFailed,
                data(json!({"error": err.to_string(), "kind": err.kind()})),
            );
            ctx.jobs.finish(job, Some(err.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{OutputSpec, ParentRef};
    use crate::datasets::DatasetKind;
    use crate::testing::RecordingOperator;

    fn engine() -> Engine {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        engine.register_operator(Arc::new(RecordingOperator::new("resize"))).unwrap();
        engine
    }

    #[test]
    fn test_create_node_fills_ports_from_operator() {
        let engine = engine();
        let raw = engine.datasets().create_dataset("raw", DatasetKind::Data, "image", None);
        let parents = vec![vec![ParentRef::dataset(raw.id)]];
        let node = engine
            .create_node(OperatorNode::new("a", "resize").with_parents(parents))
            .unwrap();
        assert_eq!(node.inputs.len(), 1);
        assert_eq!(node.outputs, vec![OutputSpec::new("output", "table")]);
    }

    #[test]
    fn test_create_node_rejects_unknown_operator() {
        let err = engine().create_node(OperatorNode::new("a", "nope")).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Configuration);
    }

    #[test]
    fn test_create_node_rejects_missing_parent() {
        let parents = vec![vec![ParentRef::operator(9, "output")]];
        let err = engine()
            .create_node(OperatorNode::new("a", "resize").with_parents(parents))
            .unwrap_err();
        assert!(err.to_string().contains("parent node 9 does not exist"));
    }

    #[test]
    fn test_node_hash_tracks_params() {
        let engine = engine();
        let raw = engine.datasets().create_dataset("raw", DatasetKind::Data, "image", None);
        let parents = vec![vec![ParentRef::dataset(raw.id)]];
        let node = engine
            .create_node(OperatorNode::new("a", "resize").with_parents(parents))
            .unwrap();

        let before = engine.node_hash(node.id).unwrap();
        assert_eq!(before, engine.node_hash(node.id).unwrap());
        engine
            .update_node(node.id, NodeUpdate::new().with_params(r#"{"w":1}"#))
            .unwrap();
        assert_ne!(before, engine.node_hash(node.id).unwrap());
    }

    #[test]
    fn test_build_graph_unknown_node() {
        let err = engine().build_graph(42).unwrap_err();
        assert!(matches!(err, PipegraphError::NotFound { kind: "node", .. }));
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_worker_url_selects_http_backend() {
        let config = EngineConfig::default().with_worker_url("http://worker:8081");
        assert!(Engine::new(config).is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Engine::new(EngineConfig::default().with_worker_slots(0)).is_err());
    }
}
