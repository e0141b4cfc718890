//! Dispatching a node's tasks to a container.

use super::{ContainerLease, ContainerRequest, PreparedRun, Task, WorkerBackend, WorkerPool};
use crate::cancellation::CancellationToken;
use crate::datasets::DatasetStore;
use crate::errors::{PipegraphError, Result, TaskError};
use crate::events::{EngineEvent, EventSink};
use crate::graph::VirtualNode;
use crate::jobs::{ExecJobOp, JobHandle, JobRegistry, JOB_TYPE_EXECNODE};
use crate::operators::Operator;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How a node execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Every task succeeded.
    Completed {
        /// Number of tasks dispatched.
        tasks: usize,
        /// Whether the outputs were marked done.
        done: bool,
    },
    /// The job was stopped before every task was claimed.
    Stopped,
}

#[derive(Default)]
struct DispatchState {
    next: usize,
    completed: usize,
    error: Option<PipegraphError>,
}

/// Runs prepared nodes on containers from a [`WorkerBackend`].
pub struct TaskExecutor {
    backend: Arc<dyn WorkerBackend>,
    pool: WorkerPool,
    jobs: Arc<JobRegistry>,
    datasets: Arc<dyn DatasetStore>,
    events: Arc<dyn EventSink>,
    coordinator_url: String,
    default_parallelism: usize,
    tail_lines: usize,
}

impl TaskExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        backend: Arc<dyn WorkerBackend>,
        pool: WorkerPool,
        jobs: Arc<JobRegistry>,
        datasets: Arc<dyn DatasetStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            backend,
            pool,
            jobs,
            datasets,
            events,
            coordinator_url: String::new(),
            default_parallelism: 1,
            tail_lines: 1000,
        }
    }

    /// Sets the URL containers reach the coordinator at.
    #[must_use]
    pub fn with_coordinator_url(mut self, url: impl Into<String>) -> Self {
        self.coordinator_url = url.into();
        self
    }

    /// Sets the parallelism used when a container declares none.
    #[must_use]
    pub fn with_default_parallelism(mut self, parallelism: usize) -> Self {
        self.default_parallelism = parallelism.max(1);
        self
    }

    /// Sets the console lines kept per execution job.
    #[must_use]
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }

    /// The worker slot pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Executes `prepared` under a new `execnode` job sharing `token`.
    ///
    /// On success the node's outputs are marked done iff the run covered all
    /// pending work. A stop is not an error.
    ///
    /// # Errors
    ///
    /// Returns the first task error, or a container acquisition error.
    pub async fn execute(
        &self,
        node: &VirtualNode,
        operator: &dyn Operator,
        prepared: PreparedRun,
        token: Arc<CancellationToken>,
    ) -> Result<ExecOutcome> {
        let op = ExecJobOp::new(
            node.name.clone(),
            self.tail_lines,
            operator.job_op(&prepared.runnable),
        );
        let job = self
            .jobs
            .start(&format!("Exec Node {}", node.name), JOB_TYPE_EXECNODE, Box::new(op), token);
        job.progress(0, prepared.tasks.len());

        let result = self.execute_job(&job, node, operator, &prepared).await;
        let error = result.as_ref().err().map(ToString::to_string);
        self.jobs.finish(&job, error);
        result
    }

    async fn execute_job(
        &self,
        job: &JobHandle,
        node: &VirtualNode,
        operator: &dyn Operator,
        prepared: &PreparedRun,
    ) -> Result<ExecOutcome> {
        let tasks = &prepared.tasks;
        if !tasks.is_empty() {
            let _slot = match self.pool.acquire(job.token()).await {
                Ok(slot) => slot,
                Err(PipegraphError::Stopped(_)) => return Ok(ExecOutcome::Stopped),
                Err(e) => return Err(e),
            };

            let request = ContainerRequest {
                node: node.name.clone(),
                image_name: operator.image_name(&prepared.runnable),
                runnable: prepared.runnable.clone(),
                job_id: job.id(),
                coordinator_url: self.coordinator_url.clone(),
            };
            let Some(lease) = self.acquire_container(job, request).await? else {
                return Ok(ExecOutcome::Stopped);
            };

            info!(node = %node.name, tasks = tasks.len(), container = %lease.uuid, "running tasks");
            let result = self.dispatch(job, node, &lease, tasks).await;
            if let Err(e) = self.backend.release_container(&lease).await {
                warn!(
                    node = %node.name,
                    container = %lease.uuid,
                    error = %e,
                    "failed to release container"
                );
            }
            if result? {
                return Ok(ExecOutcome::Stopped);
            }
        }

        if prepared.will_be_done {
            for ds in prepared.outputs.existing() {
                self.datasets.set_done(ds.id, true)?;
            }
        }
        Ok(ExecOutcome::Completed {
            tasks: tasks.len(),
            done: prepared.will_be_done,
        })
    }

    /// Waits for a container, or returns `None` if the job is stopped first.
    ///
    /// The acquisition runs as its own task; if it is abandoned, the
    /// container is released as soon as it arrives.
    async fn acquire_container(
        &self,
        job: &JobHandle,
        request: ContainerRequest,
    ) -> Result<Option<ContainerLease>> {
        let backend = self.backend.clone();
        let mut acquisition = tokio::spawn(async move { backend.acquire_container(request).await });

        let (abandon_tx, mut abandon_rx) = oneshot::channel::<()>();
        job.set_cleanup(move || {
            let _ = abandon_tx.send(());
        });

        let token = job.token().clone();
        let joined = tokio::select! {
            joined = &mut acquisition => Some(joined),
            Ok(()) = &mut abandon_rx => None,
            () = token.cancelled() => None,
        };
        job.clear_cleanup();

        match joined {
            Some(joined) => joined
                .map_err(|e| {
                    PipegraphError::Internal(format!("container acquisition panicked: {e}"))
                })?
                .map(Some),
            None => {
                debug!(job_id = job.id(), "abandoning container acquisition");
                let backend = self.backend.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(lease)) = acquisition.await {
                        if let Err(e) = backend.release_container(&lease).await {
                            warn!(
                                container = %lease.uuid,
                                error = %e,
                                "failed to release abandoned container"
                            );
                        }
                    }
                });
                Ok(None)
            }
        }
    }

    /// Runs tasks on `P` slots. Returns true if the job was stopped before
    /// every task completed.
    async fn dispatch(
        &self,
        job: &JobHandle,
        node: &VirtualNode,
        lease: &ContainerLease,
        tasks: &[Task],
    ) -> Result<bool> {
        let parallelism = match lease.parallelism {
            0 => self.default_parallelism,
            p => p,
        }
        .clamp(1, tasks.len().max(1));

        let state = Mutex::new(DispatchState::default());
        join_all((0..parallelism).map(|_| self.slot(job, node, lease, tasks, &state))).await;

        let state = state.into_inner();
        if let Some(err) = state.error {
            return Err(err);
        }
        Ok(state.completed < tasks.len())
    }

    async fn slot(
        &self,
        job: &JobHandle,
        node: &VirtualNode,
        lease: &ContainerLease,
        tasks: &[Task],
        state: &Mutex<DispatchState>,
    ) {
        loop {
            if job.token().is_cancelled() {
                return;
            }
            let task = {
                let mut s = state.lock();
                if s.error.is_some() || s.next >= tasks.len() {
                    return;
                }
                s.next += 1;
                &tasks[s.next - 1]
            };

            debug!(node = %node.name, key = %task.key, "dispatching task");
            match self.backend.exec_task(lease, task).await {
                Ok(()) => {
                    let completed = {
                        let mut s = state.lock();
                        s.completed += 1;
                        s.completed
                    };
                    job.progress(completed, tasks.len());
                }
                Err(err) => {
                    let err = match err {
                        PipegraphError::Task(e) => e,
                        other => {
                            TaskError::new(node.name.clone(), task.key.clone(), other.to_string())
                        }
                    };
                    warn!(node = %node.name, key = %task.key, error = %err.message, "task failed");
                    self.events.try_emit(
                        EngineEvent::TaskFailed,
                        Some(json!({"node": node.name, "key": task.key, "error": err.message})),
                    );
                    let mut s = state.lock();
                    if s.error.is_none() {
                        s.error = Some(err.into());
                    }
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("pool", &self.pool)
            .field("default_parallelism", &self.default_parallelism)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::{DatasetKind, InMemoryDatasetStore, OutputDatasets};
    use crate::events::CollectingEventSink;
    use crate::exec::MockWorkerBackend;
    use crate::jobs::{InMemoryJobStore, JobStatus};
    use crate::operators::Runnable;
    use crate::testing::fixtures::{operator_node, virtual_node};
    use crate::testing::RecordingOperator;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        datasets: Arc<InMemoryDatasetStore>,
        jobs: Arc<JobRegistry>,
        events: Arc<CollectingEventSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                datasets: Arc::new(InMemoryDatasetStore::new()),
                jobs: Arc::new(JobRegistry::new(Arc::new(InMemoryJobStore::new()), Duration::ZERO)),
                events: Arc::new(CollectingEventSink::new()),
            }
        }

        fn executor(&self, backend: MockWorkerBackend) -> TaskExecutor {
            TaskExecutor::new(
                Arc::new(backend),
                WorkerPool::new(1),
                self.jobs.clone(),
                self.datasets.clone(),
                self.events.clone(),
            )
            .with_default_parallelism(2)
        }

        fn prepared(&self, keys: &[&str], will_be_done: bool) -> PreparedRun {
            let ds = self
                .datasets
                .create_dataset("a[output]", DatasetKind::Computed, "table", Some("h[output]"));
            let mut outputs = OutputDatasets::default();
            outputs.datasets.insert("output".to_string(), Some(ds.clone()));
            let mut output_datasets = BTreeMap::new();
            output_datasets.insert("output".to_string(), ds);
            PreparedRun {
                runnable: Runnable {
                    name: "a".to_string(),
                    op: "resize".to_string(),
                    params: String::new(),
                    input_datasets: BTreeMap::new(),
                    output_datasets,
                },
                tasks: keys.iter().map(|k| Task::new(*k)).collect(),
                will_be_done,
                outputs,
            }
        }

        fn output_done(&self) -> bool {
            self.datasets.find_by_hash("h[output]").unwrap().done
        }
    }

    fn lease(parallelism: usize) -> ContainerLease {
        ContainerLease {
            uuid: "c1".to_string(),
            base_url: "http://container".to_string(),
            parallelism,
        }
    }

    fn node() -> VirtualNode {
        virtual_node(&operator_node(1, "a", "resize", vec![]))
    }

    #[tokio::test]
    async fn test_all_tasks_succeed_and_mark_done() {
        let h = Harness::new();
        let mut backend = MockWorkerBackend::new();
        backend
            .expect_acquire_container()
            .times(1)
            .returning(|_| Ok(lease(0)));
        backend.expect_exec_task().times(3).returning(|_, _| Ok(()));
        backend.expect_release_container().times(1).returning(|_| Ok(()));

        let outcome = h
            .executor(backend)
            .execute(
                &node(),
                &RecordingOperator::new("resize"),
                h.prepared(&["k1", "k2", "k3"], true),
                Arc::new(CancellationToken::new()),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ExecOutcome::Completed { tasks: 3, done: true });
        assert!(h.output_done());
        let job = h.jobs.store().get(1).unwrap();
        assert!(job.done);
        assert!(job.error.is_none());
        assert_eq!(job.op["percent"], 100.0);
    }

    #[tokio::test]
    async fn test_incomplete_run_leaves_outputs_not_done() {
        let h = Harness::new();
        let mut backend = MockWorkerBackend::new();
        backend.expect_acquire_container().returning(|_| Ok(lease(1)));
        backend.expect_exec_task().returning(|_, _| Ok(()));
        backend.expect_release_container().returning(|_| Ok(()));

        let outcome = h
            .executor(backend)
            .execute(
                &node(),
                &RecordingOperator::new("resize"),
                h.prepared(&["k1"], false),
                Arc::new(CancellationToken::new()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Completed { tasks: 1, done: false });
        assert!(!h.output_done());
    }

    #[tokio::test]
    async fn test_first_failure_halts_dispatch_and_releases() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut backend = MockWorkerBackend::new();
        backend.expect_acquire_container().returning(|_| Ok(lease(1)));
        backend.expect_exec_task().returning(move |_, task| {
            counter.fetch_add(1, Ordering::SeqCst);
            if task.key == "k2" {
                Err(PipegraphError::Transport("connection reset".to_string()))
            } else {
                Ok(())
            }
        });
        backend.expect_release_container().times(1).returning(|_| {
            Err(PipegraphError::Transport("worker gone".to_string()))
        });

        let err = h
            .executor(backend)
            .execute(
                &node(),
                &RecordingOperator::new("resize"),
                h.prepared(&["k1", "k2", "k3", "k4"], true),
                Arc::new(CancellationToken::new()),
            )
            .await
            .unwrap_err();

        match err {
            PipegraphError::Task(e) => {
                assert_eq!(e.key, "k2");
                assert!(e.message.contains("connection reset"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!h.output_done());
        assert_eq!(h.events.count(EngineEvent::TaskFailed), 1);
        assert!(h.jobs.store().get(1).unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_token_claims_nothing() {
        let h = Harness::new();
        let mut backend = MockWorkerBackend::new();
        backend.expect_acquire_container().times(0);
        backend.expect_exec_task().times(0);

        let token = Arc::new(CancellationToken::new());
        token.cancel("stop");
        let outcome = h
            .executor(backend)
            .execute(
                &node(),
                &RecordingOperator::new("resize"),
                h.prepared(&["k1"], true),
                token,
            )
            .await
            .unwrap();

        assert_eq!(outcome, ExecOutcome::Stopped);
        assert!(!h.output_done());
        let job = h.jobs.store().get(1).unwrap();
        assert_eq!(job.state, JobStatus::Done);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_empty_task_list_needs_no_container() {
        let h = Harness::new();
        let mut backend = MockWorkerBackend::new();
        backend.expect_acquire_container().times(0);

        let outcome = h
            .executor(backend)
            .execute(
                &node(),
                &RecordingOperator::new("resize"),
                h.prepared(&[], true),
                Arc::new(CancellationToken::new()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Completed { tasks: 0, done: true });
        assert!(h.output_done());
    }
}
