//! Process-wide registry of running jobs.

use super::{Job, JobHandle, JobOp, JobStore};
use crate::cancellation::CancellationToken;
use crate::errors::{PipegraphError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Console output pushed by a worker for a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    /// Target job.
    pub job_id: i64,
    /// New console lines.
    pub lines: Vec<String>,
}

/// Maps running job ids to their live handles.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    running: DashMap<i64, Arc<JobHandle>>,
    persist_interval: Duration,
}

impl JobRegistry {
    /// Creates a registry over a job store.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, persist_interval: Duration) -> Self {
        Self {
            store,
            running: DashMap::new(),
            persist_interval,
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Records a job and registers its live handle in state `Running`.
    pub fn start(
        &self,
        name: &str,
        job_type: &str,
        op: Box<dyn JobOp>,
        token: Arc<CancellationToken>,
    ) -> Arc<JobHandle> {
        let job = self.store.new_job(name, job_type, serde_json::Value::Null);
        let handle = Arc::new(JobHandle::new(
            job.id,
            job.name,
            self.store.clone(),
            token,
            op,
            self.persist_interval,
        ));
        handle.mark_running();
        self.running.insert(job.id, handle.clone());
        debug!(job_id = job.id, job_type, "job started");
        handle
    }

    /// Marks a job done and unregisters it.
    pub fn finish(&self, handle: &JobHandle, error: Option<String>) {
        handle.finish(error);
        self.running.remove(&handle.id());
    }

    /// Returns the live handle of a running job.
    #[must_use]
    pub fn get(&self, id: i64) -> Option<Arc<JobHandle>> {
        self.running.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns the stored record of any job.
    #[must_use]
    pub fn job(&self, id: i64) -> Option<Job> {
        self.store.get(id)
    }

    /// Ids of running jobs, sorted.
    #[must_use]
    pub fn running(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Applies console output pushed by a worker.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the job is not running.
    pub fn apply_update(&self, update: &JobUpdate) -> Result<()> {
        let handle = self
            .get(update.job_id)
            .ok_or_else(|| PipegraphError::not_found("running job", update.job_id))?;
        handle.update(&update.lines);
        Ok(())
    }

    /// Stops a job and waits for it to finish. Stopping a finished job is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown jobs, or an internal error if
    /// the job does not finish within `timeout`.
    pub async fn stop(&self, id: i64, timeout: Duration) -> Result<()> {
        let Some(handle) = self.get(id) else {
            return match self.store.get(id) {
                Some(_) => Ok(()),
                None => Err(PipegraphError::not_found("job", id)),
            };
        };
        handle.stop(timeout).await
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobStatus, TailJobOp, JOB_TYPE_MULTIEXEC};

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(InMemoryJobStore::new()), Duration::ZERO)
    }

    fn start(registry: &JobRegistry) -> Arc<JobHandle> {
        registry.start(
            "run",
            JOB_TYPE_MULTIEXEC,
            Box::new(TailJobOp::new(10)),
            Arc::new(CancellationToken::new()),
        )
    }

    #[test]
    fn test_start_and_finish() {
        let registry = registry();
        let handle = start(&registry);
        assert_eq!(registry.running(), vec![handle.id()]);
        assert_eq!(registry.job(handle.id()).unwrap().state, JobStatus::Running);

        registry.finish(&handle, None);
        assert!(registry.running().is_empty());
        assert!(registry.job(handle.id()).unwrap().done);
    }

    #[test]
    fn test_apply_update() {
        let registry = registry();
        let handle = start(&registry);
        registry
            .apply_update(&JobUpdate {
                job_id: handle.id(),
                lines: vec!["hello".to_string()],
            })
            .unwrap();
        assert_eq!(registry.job(handle.id()).unwrap().op["lines"], serde_json::json!(["hello"]));

        registry.finish(&handle, None);
        let err = registry
            .apply_update(&JobUpdate {
                job_id: handle.id(),
                lines: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, PipegraphError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_stop_finished_and_unknown_jobs() {
        let registry = registry();
        let handle = start(&registry);
        registry.finish(&handle, None);

        registry.stop(handle.id(), Duration::from_millis(10)).await.unwrap();
        assert!(registry.stop(404, Duration::from_millis(10)).await.is_err());
    }
}
