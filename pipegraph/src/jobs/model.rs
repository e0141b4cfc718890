//! Persisted job records.

use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Job type of scheduler and incremental runs.
pub const JOB_TYPE_MULTIEXEC: &str = "multiexec";

/// Job type of a single node's task execution.
pub const JOB_TYPE_EXECNODE: &str = "execnode";

/// Lifecycle of a job.
///
/// Transitions only move forward: `Created -> Running -> (Stopping) -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded but not started.
    #[default]
    Created,
    /// Executing.
    Running,
    /// A stop was requested and the job has not yet observed it.
    Stopping,
    /// Finished, with or without an error.
    Done,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A tracked run of the scheduler or of one node's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Store id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// [`JOB_TYPE_MULTIEXEC`] or [`JOB_TYPE_EXECNODE`].
    pub job_type: String,
    /// Last persisted progress state of the job's operation.
    #[serde(default)]
    pub op: serde_json::Value,
    /// Job metadata. Multi-node jobs record `{"node_ids": [...]}` here.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When the job was created.
    pub start_time: Timestamp,
    /// Lifecycle state.
    pub state: JobStatus,
    /// True once the job finished.
    pub done: bool,
    /// Error message if the job failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Operator node ids committed to the metadata of a multi-node job.
    #[must_use]
    pub fn node_ids(&self) -> Vec<i64> {
        self.metadata
            .get("node_ids")
            .and_then(serde_json::Value::as_array)
            .map(|ids| ids.iter().filter_map(serde_json::Value::as_i64).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;

    #[test]
    fn test_status_order() {
        assert!(JobStatus::Created < JobStatus::Running);
        assert!(JobStatus::Stopping < JobStatus::Done);
        assert_eq!(JobStatus::Stopping.to_string(), "stopping");
    }

    #[test]
    fn test_node_ids_from_metadata() {
        let mut job = Job {
            id: 1,
            name: "run".to_string(),
            job_type: JOB_TYPE_MULTIEXEC.to_string(),
            op: serde_json::Value::Null,
            metadata: serde_json::json!({"node_ids": [3, 5]}),
            start_time: now_utc(),
            state: JobStatus::Running,
            done: false,
            error: None,
        };
        assert_eq!(job.node_ids(), vec![3, 5]);

        job.metadata = serde_json::Value::Null;
        assert!(job.node_ids().is_empty());
    }
}
