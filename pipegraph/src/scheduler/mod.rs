//! Scheduling of execution graphs.
//!
//! [`Scheduler::run`] drives a graph until its target is ready, resolving and
//! executing nodes as their parents complete. [`Scheduler::incremental`]
//! produces a subset of an incremental node's output keys.

mod incremental;
mod run;
mod state;


pub use incremental::{IncrementalSummary, WantedKeys};
pub use run::{RunOptions, RunSummary, Scheduler};
pub use state::RunState;
