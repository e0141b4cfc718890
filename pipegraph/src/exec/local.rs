//! In-process containers.

use super::{ContainerLease, ContainerRequest, Task, WorkerBackend};
use crate::datasets::DatasetStore;
use crate::errors::{PipegraphError, Result};
use crate::operators::{Executable, OperatorRegistry, PrepareContext};
use crate::utils::generate_uuid;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Runs executables inside the coordinator process.
///
/// A "container" is the [`Executable`] the operator prepares for the
/// request; it lives until released.
pub struct LocalWorkerBackend {
    operators: Arc<OperatorRegistry>,
    datasets: Arc<dyn DatasetStore>,
    containers: DashMap<String, Arc<dyn Executable>>,
}

impl LocalWorkerBackend {
    /// Creates a backend preparing executables from `operators`.
    #[must_use]
    pub fn new(operators: Arc<OperatorRegistry>, datasets: Arc<dyn DatasetStore>) -> Self {
        Self {
            operators,
            datasets,
            containers: DashMap::new(),
        }
    }

    /// Number of containers not yet released.
    #[must_use]
    pub fn active(&self) -> usize {
        self.containers.len()
    }
}

#[async_trait]
impl WorkerBackend for LocalWorkerBackend {
    async fn acquire_container(&self, request: ContainerRequest) -> Result<ContainerLease> {
        let operator = self.operators.get(&request.runnable.op)?;
        let ctx = PrepareContext {
            coordinator_url: request.coordinator_url.clone(),
            datasets: self.datasets.clone(),
        };
        let executable: Arc<dyn Executable> = Arc::from(operator.prepare(&request.runnable, &ctx)?);
        let uuid = generate_uuid();
        let lease = ContainerLease {
            base_url: format!("local://{uuid}"),
            parallelism: executable.parallelism(),
            uuid,
        };
        debug!(node = %request.node, container = %lease.uuid, "started local container");
        self.containers.insert(lease.uuid.clone(), executable);
        Ok(lease)
    }

    async fn exec_task(&self, lease: &ContainerLease, task: &Task) -> Result<()> {
        let executable = self
            .containers
            .get(&lease.uuid)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PipegraphError::not_found("container", &lease.uuid))?;
        executable.apply(task).await
    }

    async fn release_container(&self, lease: &ContainerLease) -> Result<()> {
        self.containers
            .remove(&lease.uuid)
            .map(|_| ())
            .ok_or_else(|| PipegraphError::not_found("container", &lease.uuid))
    }
}

impl std::fmt::Debug for LocalWorkerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorkerBackend")
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}
