//! Error types for the pipegraph engine.
//!
//! The taxonomy follows how failures reach a caller: configuration errors are
//! returned before any job exists, scheduling and task errors end the job with
//! an error, and conflicts are rejected before any execution begins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for pipegraph operations.
#[derive(Debug, Error)]
pub enum PipegraphError {
    /// The configured graph or a request is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The scheduler could not make progress.
    #[error("{0}")]
    Scheduling(#[from] SchedulingError),

    /// A task failed on a remote executor.
    #[error("{0}")]
    Task(#[from] TaskError),

    /// Another running job already claims some of the same nodes.
    #[error("{0}")]
    Conflict(#[from] JobConflictError),

    /// A referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// The kind of entity ("node", "dataset", "job", ...).
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The job was stopped before the operation finished.
    #[error("Job stopped: {0}")]
    Stopped(String),

    /// Communication with a worker or container failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`PipegraphError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Reported synchronously, no job is created.
    Configuration,
    /// Aborts the run.
    Scheduling,
    /// Halts dispatch for the node being executed.
    Task,
    /// Reported before any execution begins.
    Conflict,
    /// The job was stopped.
    Stopped,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Scheduling => write!(f, "scheduling"),
            Self::Task => write!(f, "task"),
            Self::Conflict => write!(f, "conflict"),
            Self::Stopped => write!(f, "stopped"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl PipegraphError {
    /// Returns the taxonomy bucket of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::NotFound { .. } => ErrorKind::Configuration,
            Self::Scheduling(_) => ErrorKind::Scheduling,
            Self::Task(_) => ErrorKind::Task,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Stopped(_) => ErrorKind::Stopped,
            Self::Transport(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for a configuration error with only a message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::new(message))
    }
}

/// Metadata about an error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code,
            "summary": self.summary,
            "fix_hint": self.fix_hint,
            "context": self.context,
        })
    }
}

/// Error raised when the configured graph or a request is invalid.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The node involved, if any.
    pub node: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node: None,
        }
    }

    /// Sets the node involved.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

/// Errors raised while driving the graph to completion.
#[derive(Debug, Clone, Error)]
pub enum SchedulingError {
    /// The graph contains a dependency cycle.
    #[error("{0}")]
    Cycle(#[from] CycleDetectedError),

    /// A full pass executed nothing and resolved nothing.
    #[error("Unsatisfiable graph: no progress possible for nodes [{}]", nodes.join(", "))]
    Unsatisfiable {
        /// The nodes that were still needed.
        nodes: Vec<String>,
        /// Error info.
        info: ErrorInfo,
    },

    /// A node kept rewriting itself.
    #[error("Resolution loop at node {node}: resolved {attempts} times")]
    ResolutionLoop {
        /// The node that keeps resolving.
        node: String,
        /// How many resolutions were observed.
        attempts: usize,
        /// Error info.
        info: ErrorInfo,
    },

    /// A node references a virtual parent that is not part of the graph.
    #[error("Node {node} references virtual parent {parent} which is not in the graph")]
    DanglingVirtualParent {
        /// The child node.
        node: String,
        /// The missing virtual parent.
        parent: String,
    },

    /// A parent hash was needed but never computed.
    #[error("Hash for {0} is not available")]
    MissingHash(String),
}

impl SchedulingError {
    /// Creates an unsatisfiable-graph error.
    #[must_use]
    pub fn unsatisfiable(nodes: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-UNSATISFIABLE",
            format!("{} needed nodes have no runnable candidate", nodes.len()),
        )
        .with_fix_hint("Check that every parent of the needed nodes can be produced.");
        Self::Unsatisfiable { nodes, info }
    }

    /// Creates a resolution-loop error.
    #[must_use]
    pub fn resolution_loop(node: impl Into<String>, attempts: usize) -> Self {
        let node = node.into();
        let info = ErrorInfo::new(
            "GRAPH-RESOLUTION-LOOP",
            format!("Node {node} was resolved {attempts} times in one run"),
        )
        .with_fix_hint("Resolve must return None once the replacement's inputs are satisfied.");
        Self::ResolutionLoop {
            node,
            attempts,
            info,
        }
    }

    /// Returns the error code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Cycle(err) => &err.error_info.code,
            Self::Unsatisfiable { info, .. } | Self::ResolutionLoop { info, .. } => &info.code,
            Self::DanglingVirtualParent { .. } => "GRAPH-DANGLING-VIRTUAL",
            Self::MissingHash(_) => "GRAPH-MISSING-HASH",
        }
    }
}

/// Error raised when a cycle is detected in the execution graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of nodes forming the cycle.
    pub cycle_path: Vec<String>,
    /// Error info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-CYCLE",
            format!("Graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint(
            "Operators may not depend on their own outputs; remove one edge of the cycle.",
        );

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a task fails on its executor.
#[derive(Debug, Clone, Error)]
#[error("Task {key} of node {node} failed: {message}")]
pub struct TaskError {
    /// The node whose task failed.
    pub node: String,
    /// The task key.
    pub key: String,
    /// The failure reported by the executor.
    pub message: String,
}

impl TaskError {
    /// Creates a new task error.
    #[must_use]
    pub fn new(
        node: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Error raised when two multi-node jobs claim overlapping nodes.
#[derive(Debug, Clone, Error)]
#[error("Job {job_id} conflicts with running job {conflicting_job_id} on nodes {node_ids:?}")]
pub struct JobConflictError {
    /// The job that was rejected.
    pub job_id: i64,
    /// The job that already holds the nodes.
    pub conflicting_job_id: i64,
    /// The overlapping operator node ids.
    pub node_ids: Vec<i64>,
    /// Error info.
    pub error_info: ErrorInfo,
}

impl JobConflictError {
    /// Creates a new conflict error.
    #[must_use]
    pub fn new(job_id: i64, conflicting_job_id: i64, node_ids: Vec<i64>) -> Self {
        let info = ErrorInfo::new(
            "JOB-CONFLICT",
            format!(
                "{} nodes are already being executed by job {conflicting_job_id}",
                node_ids.len()
            ),
        )
        .with_fix_hint("Wait for the other job to finish or stop it first.")
        .with_context_entry("conflicting_job_id", conflicting_job_id.to_string());

        Self {
            job_id,
            conflicting_job_id,
            node_ids,
            error_info: info,
        }
    }
}

/// Convenience result alias.
pub type Result<T, E = PipegraphError> = std::result::Result<T, E>;
