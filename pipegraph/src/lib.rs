//! # Pipegraph
//!
//! Incremental, content-addressed execution of operator graphs.
//!
//! Pipegraph takes a graph of configured operator nodes and drives it to
//! completion on remote (or in-process) workers with support for:
//!
//! - **Content-hash memoization**: a node whose output dataset for its current
//!   hash is done is never executed again
//! - **Run-time resolution**: operators can rewrite themselves into a larger
//!   subgraph just before they execute
//! - **Incremental runs**: produce a handful of output keys without computing
//!   the whole pipeline
//! - **Job tracking**: every run is an observable, stoppable job, and
//!   overlapping runs are rejected
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipegraph::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::from_env()?)?;
//! engine.register_operator(Arc::new(MyResize))?;
//!
//! let raw = engine.datasets().create_dataset("raw", DatasetKind::Data, "image", None);
//! let resize = engine.create_node(
//!     OperatorNode::new("resize", "resize").with_parents(vec![vec![ParentRef::dataset(raw.id)]]),
//! )?;
//!
//! let summary = engine.run_node(resize.id, RunOptions::default()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod catalog;
pub mod config;
pub mod datasets;
pub mod engine;
pub mod errors;
pub mod events;
pub mod exec;
pub mod graph;
pub mod jobs;
pub mod observability;
pub mod operators;
pub mod scheduler;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::catalog::{InputSpec, NodeStore, NodeUpdate, OperatorNode, OutputSpec, ParentRef};
    pub use crate::config::{EngineConfig, LogConfig, LogFormat};
    pub use crate::datasets::{Dataset, DatasetKind, DatasetStore, InMemoryDatasetStore, Item};
    pub use crate::engine::{Engine, EngineBuilder, RunHandle};
    pub use crate::errors::{ErrorKind, PipegraphError, Result};
    pub use crate::events::{EngineEvent, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::exec::{LocalWorkerBackend, Task, WorkerBackend};
    pub use crate::graph::{ExecutionGraph, GraphId, VirtualNode};
    pub use crate::jobs::{Job, JobStatus};
    pub use crate::observability::init_tracing;
    pub use crate::operators::{Executable, Operator, OperatorConfig, PrepareContext, Runnable};
    pub use crate::scheduler::{IncrementalSummary, RunOptions, RunSummary, WantedKeys};
    pub use crate::utils::{generate_uuid, iso_timestamp, Timestamp};
}
