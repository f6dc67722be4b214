//! Build graph and topological scheduler
//!
//! This crate owns the runtime projection of the target set: a directed
//! acyclic graph of [`BuildNode`]s constructed from declarative
//! [`Target`]s. It answers the three scheduler queries (topological
//! order, ready set, graph statistics) and enforces the node
//! lifecycle invariants:
//!
//! - status advances monotonically per attempt
//!   (`Pending -> Ready -> Running -> {Success|Cached|Failed|Skipped}`),
//! - a node is ready iff every dependency is `Success` or `Cached`,
//! - a cycle is rejected at edge-insertion time with the offending path,
//! - a failure cascades `Skipped` to dependents and never touches
//!   sibling branches.
//!
//! Nodes reference each other by [`TargetId`] only; the graph owns the
//! nodes and edges are id lookups, so there are no pointer cycles.

mod graph;
mod node;
mod target;

pub use graph::{BuildGraph, GraphStats};
pub use node::{BuildNode, NodeStatus};
pub use target::{Target, TargetId, TargetKind};
