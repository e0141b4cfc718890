//! Job tracking.
//!
//! Every scheduler run is a `multiexec` job and every node execution inside
//! it an `execnode` job. Jobs are persisted through a [`JobStore`]; while
//! running they also have a live [`JobHandle`] in the [`JobRegistry`], which
//! is what status updates and stop requests go through.

mod conflict;
mod handle;
mod model;
mod ops;
mod registry;
mod store;

pub use conflict::ConflictGuard;
pub use handle::{JobCleanup, JobHandle};
pub use model::{Job, JobStatus, JOB_TYPE_EXECNODE, JOB_TYPE_MULTIEXEC};
pub use ops::{ExecJobOp, JobOp, RunJobOp, TailJobOp};
pub use registry::{JobRegistry, JobUpdate};
pub use store::{InMemoryJobStore, JobStore};
