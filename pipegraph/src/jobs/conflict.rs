//! Cross-job conflict detection.

use super::{JobStore, JOB_TYPE_MULTIEXEC};
use crate::errors::{JobConflictError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::warn;

/// Rejects multi-node jobs whose node sets overlap a running job's.
///
/// Commit and scan happen under one lock, so of two overlapping jobs the
/// second to commit is the one rejected.
#[derive(Debug, Default)]
pub struct ConflictGuard {
    lock: Mutex<()>,
}

impl ConflictGuard {
    /// Creates a guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits `node_ids` into the metadata of job `job_id`, then checks
    /// every other unfinished multi-node job for overlap.
    ///
    /// # Errors
    ///
    /// Returns [`JobConflictError`] on overlap, or a not-found error if the
    /// job does not exist.
    pub fn commit(&self, store: &dyn JobStore, job_id: i64, node_ids: &[i64]) -> Result<()> {
        let _guard = self.lock.lock();
        store.update_metadata(job_id, serde_json::json!({ "node_ids": node_ids }))?;

        let ours: BTreeSet<i64> = node_ids.iter().copied().collect();
        for job in store.list() {
            if job.id == job_id || job.done || job.job_type != JOB_TYPE_MULTIEXEC {
                continue;
            }
            let overlap: Vec<i64> =
                job.node_ids().into_iter().filter(|id| ours.contains(id)).collect();
            if !overlap.is_empty() {
                warn!(job_id, conflicting_job_id = job.id, nodes = ?overlap, "job conflict");
                return Err(JobConflictError::new(job_id, job.id, overlap).into());
            }
        }
        Ok(())
    }
}
