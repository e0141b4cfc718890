//! Cooperative cancellation for job execution.
//!
//! Cancellation is checked at task-claim granularity; nothing in this module
//! interrupts an in-flight remote call.

mod token;

pub use token::CancellationToken;
