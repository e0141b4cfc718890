//! Configured operator nodes.
//!
//! These are the persistent, user-edited nodes. The scheduler never works on
//! them directly; it virtualizes them into [`VirtualNode`](crate::graph::VirtualNode)s.

mod node;
mod store;

pub use node::{InputSpec, NodeUpdate, OperatorNode, OutputSpec, ParentRef};
pub use store::NodeStore;
