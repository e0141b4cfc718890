//! Task preparation and dispatch.
//!
//! [`prepare_run`] turns a node whose parents are ready into [`Task`]s;
//! [`TaskExecutor`] acquires a worker slot and a container and fans the
//! tasks out over the container's declared parallelism.

mod backend;
mod executor;
#[cfg(feature = "http")]
mod http;
mod local;
mod pool;
mod prepare;
mod task;

#[cfg(test)]
pub use backend::MockWorkerBackend;
pub use backend::{ContainerLease, ContainerRequest, WorkerBackend};
pub use executor::{ExecOutcome, TaskExecutor};
#[cfg(feature = "http")]
pub use http::HttpWorkerBackend;
pub use local::LocalWorkerBackend;
pub use pool::{WorkerPool, WorkerSlot};
pub use prepare::{gather_inputs, prepare_run, NodeInputs, PrepareOptions, PreparedRun};
pub use task::Task;
