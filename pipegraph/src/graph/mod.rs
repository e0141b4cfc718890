//! The execution graph model.
//!
//! [`GraphId`]s name nodes, [`ExecutionGraph`] holds them, [`compute_hashes`]
//! derives content hashes and [`GraphBuilder`] expands a root node into its
//! ancestors or merges a resolved subgraph into a running graph.

mod builder;
mod hash;
mod id;
mod node;

pub use builder::{GraphBuilder, GraphSource};
pub use hash::compute_hashes;
pub use id::{GraphId, NodeKind};
pub use node::{ExecutionGraph, GraphNode, Node, VirtualNode, VirtualParent};
