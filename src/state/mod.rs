//! State Management Module
//!
//! Node handles of a partition and the persistent sync markers stored
//! inside each node file.

mod node;
mod tracker;

pub use node::{Node, NodeId, NodeRole, NodeSnapshot, NodeStatus};
pub use tracker::StateTracker;
pub(crate) use tracker::SYNC_STATE_SCHEMA;
