//! Job persistence.

use super::{Job, JobStatus};
use crate::errors::{PipegraphError, Result};
use crate::utils::now_utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Persists job records.
pub trait JobStore: Send + Sync {
    /// Records a new job in state `Created`.
    fn new_job(&self, name: &str, job_type: &str, metadata: serde_json::Value) -> Job;

    /// Looks up a job.
    fn get(&self, id: i64) -> Option<Job>;

    /// Lists every job, ordered by id.
    fn list(&self) -> Vec<Job>;

    /// Replaces the persisted operation state.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown jobs.
    fn update_state(&self, id: i64, op: serde_json::Value) -> Result<()>;

    /// Replaces the metadata.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown jobs.
    fn update_metadata(&self, id: i64, metadata: serde_json::Value) -> Result<()>;

    /// Moves the job to a new lifecycle state. Moving backwards is ignored.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown jobs.
    fn set_status(&self, id: i64, state: JobStatus) -> Result<()>;

    /// Marks the job done with an optional error.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown jobs.
    fn set_done(&self, id: i64, error: Option<String>) -> Result<()>;
}

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<i64, Job>,
    next_id: i64,
}

/// A [`JobStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(&self, id: i64, f: impl FnOnce(&mut Job) -> T) -> Result<T> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PipegraphError::not_found("job", id))?;
        Ok(f(job))
    }
}

impl JobStore for InMemoryJobStore {
    fn new_job(&self, name: &str, job_type: &str, metadata: serde_json::Value) -> Job {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let job = Job {
            id: inner.next_id,
            name: name.to_string(),
            job_type: job_type.to_string(),
            op: serde_json::Value::Null,
            metadata,
            start_time: now_utc(),
            state: JobStatus::Created,
            done: false,
            error: None,
        };
        inner.jobs.insert(job.id, job.clone());
        job
    }

    fn get(&self, id: i64) -> Option<Job> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    fn list(&self) -> Vec<Job> {
        self.inner.lock().jobs.values().cloned().collect()
    }

    fn update_state(&self, id: i64, op: serde_json::Value) -> Result<()> {
        self.with_job(id, |job| job.op = op)
    }

    fn update_metadata(&self, id: i64, metadata: serde_json::Value) -> Result<()> {
        self.with_job(id, |job| job.metadata = metadata)
    }

    fn set_status(&self, id: i64, state: JobStatus) -> Result<()> {
        self.with_job(id, |job| {
            if state > job.state {
                job.state = state;
            }
        })
    }

    fn set_done(&self, id: i64, error: Option<String>) -> Result<()> {
        self.with_job(id, |job| {
            job.state = JobStatus::Done;
            job.done = true;
            job.error = error;
        })
    }
}
