//! Service API Module
//!
//! The operations a request layer exposes, over one set of month
//! partitions.

mod service;

pub use service::MonthSync;

use serde::{Deserialize, Serialize};

use crate::changelog::Sequence;
use crate::partition::MonthKey;
use crate::state::{NodeId, NodeRole};

/// Write response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub sequence: Sequence,
    pub month: MonthKey,
    /// Rows changed on the primary; 0 when an UPDATE or DELETE matched nothing
    pub affected_rows: usize,
    /// Id of the inserted row, for statements that inserted one
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_insert_id: Option<i64>,
}

/// Health of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub id: NodeId,
    pub role: NodeRole,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Health response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// True when the primary answers
    pub healthy: bool,
    pub month: MonthKey,
    pub nodes: Vec<NodeHealth>,
    pub replication_running: bool,
    pub uptime_seconds: u64,
}
