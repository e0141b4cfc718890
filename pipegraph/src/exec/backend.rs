//! The seam between the executor and whatever runs containers.

use super::Task;
use crate::errors::Result;
use crate::operators::Runnable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Request for a container able to run one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    /// Node name, for logs.
    pub node: String,
    /// Image the container must run.
    pub image_name: String,
    /// What the container executes.
    pub runnable: Runnable,
    /// Execution job the container reports console output to.
    pub job_id: i64,
    /// URL the container reaches the coordinator at.
    pub coordinator_url: String,
}

/// A container allocated to one node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLease {
    /// Container id.
    pub uuid: String,
    /// URL tasks are posted to.
    pub base_url: String,
    /// Declared number of concurrent tasks; 0 if the container did not say.
    #[serde(default)]
    pub parallelism: usize,
}

/// Allocates containers and runs tasks in them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Blocks until a container is ready.
    async fn acquire_container(&self, request: ContainerRequest) -> Result<ContainerLease>;

    /// Runs one task to completion inside the container.
    async fn exec_task(&self, lease: &ContainerLease, task: &Task) -> Result<()>;

    /// Shuts the container down.
    async fn release_container(&self, lease: &ContainerLease) -> Result<()>;
}
