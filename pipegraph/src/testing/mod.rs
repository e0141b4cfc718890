//! Testing utilities for pipegraph engines.
//!
//! This module provides:
//! - Graph and catalog fixtures
//! - Instrumented operators that record, fail, or block on a gate
//! - An engine harness with an in-process worker backend

pub mod fixtures;
mod operators;

pub use fixtures::{MapSource, TestEngine};
pub use operators::{
    DefaultProviderOperator, ExecutionLog, FailingOperator, Gate, GatedOperator, RecordingOperator,
};
