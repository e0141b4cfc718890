//! Live handle of a running job.

use super::{JobOp, JobStatus, JobStore};
use crate::cancellation::CancellationToken;
use crate::errors::{PipegraphError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Cleanup registered by the current phase of a job, run once on stop.
pub type JobCleanup = Box<dyn FnOnce() + Send>;

/// The in-memory side of a running job.
///
/// Owns the job's cancellation token and live [`JobOp`], throttles how often
/// progress is persisted, and publishes the lifecycle state on a watch
/// channel so [`JobHandle::stop`] can wait for the job to reach `Done`.
pub struct JobHandle {
    id: i64,
    name: String,
    store: Arc<dyn JobStore>,
    token: Arc<CancellationToken>,
    status: watch::Sender<JobStatus>,
    op: Mutex<Box<dyn JobOp>>,
    cleanup: Mutex<Option<JobCleanup>>,
    persist_interval: Duration,
    last_persist: Mutex<Option<Instant>>,
}

impl JobHandle {
    /// Wraps a stored job.
    #[must_use]
    pub fn new(
        id: i64,
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        token: Arc<CancellationToken>,
        op: Box<dyn JobOp>,
        persist_interval: Duration,
    ) -> Self {
        let (status, _) = watch::channel(JobStatus::Created);
        Self {
            id,
            name: name.into(),
            store,
            token,
            status,
            op: Mutex::new(op),
            cleanup: Mutex::new(None),
            persist_interval,
            last_persist: Mutex::new(None),
        }
    }

    /// Job id.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The token worker slots check before claiming a task.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Subscribes to lifecycle changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.subscribe()
    }

    /// Registers the cleanup of the job's current phase, replacing any
    /// previous one.
    ///
    /// If the job is already stopping the cleanup runs immediately.
    pub fn set_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        if self.token.is_cancelled() {
            cleanup();
            return;
        }
        *self.cleanup.lock() = Some(Box::new(cleanup));
    }

    /// Drops the registered cleanup without running it.
    pub fn clear_cleanup(&self) {
        self.cleanup.lock().take();
    }

    /// Moves the job from `Created` to `Running`.
    pub fn mark_running(&self) {
        self.advance(JobStatus::Running);
    }

    /// Appends console lines and persists the op state, throttled.
    pub fn update(&self, lines: &[String]) {
        self.op.lock().update(lines);
        self.persist(false);
    }

    /// Records progress and persists the op state, throttled unless the work
    /// is complete.
    pub fn progress(&self, completed: usize, total: usize) {
        self.op.lock().progress(completed, total);
        self.persist(completed >= total);
    }

    /// Persists the final op state and marks the job done.
    pub fn finish(&self, error: Option<String>) {
        self.persist(true);
        match &error {
            Some(err) => warn!(job_id = self.id, job = %self.name, error = %err, "job failed"),
            None => info!(job_id = self.id, job = %self.name, "job done"),
        }
        if let Err(e) = self.store.set_done(self.id, error) {
            warn!(job_id = self.id, error = %e, "failed to persist job completion");
        }
        self.status.send_replace(JobStatus::Done);
    }

    /// Requests a cooperative stop and waits until the job reaches `Done`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the job does not finish within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        if *rx.borrow() == JobStatus::Done {
            return Ok(());
        }

        self.advance(JobStatus::Stopping);
        self.token.cancel(format!("job {} stopped", self.id));
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            debug!(job_id = self.id, "running job cleanup");
            cleanup();
        }

        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| *s == JobStatus::Done))
            .await
            .map(|seen| seen.is_ok());
        match waited {
            Ok(_) => Ok(()),
            Err(_) => Err(PipegraphError::Internal(format!(
                "job {} did not stop within {timeout:?}",
                self.id
            ))),
        }
    }

    fn advance(&self, state: JobStatus) {
        let changed = self.status.send_if_modified(|current| {
            if state > *current {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            if let Err(e) = self.store.set_status(self.id, state) {
                warn!(job_id = self.id, error = %e, "failed to persist job state");
            }
        }
    }

    fn persist(&self, force: bool) {
        {
            let mut last = self.last_persist.lock();
            let due = last.map_or(true, |t| t.elapsed() >= self.persist_interval);
            if !force && !due {
                return;
            }
            *last = Some(Instant::now());
        }
        let state = self.op.lock().encode();
        if let Err(e) = self.store.update_state(self.id, state) {
            warn!(job_id = self.id, error = %e, "failed to persist job progress");
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
