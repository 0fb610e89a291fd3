//! Replication Module
//!
//! Replays each partition's change log from the primary onto its replicas
//! in strict sequence order.

mod catchup;
mod coordinator;

pub use coordinator::{ReplicationHandle, SyncCoordinator};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::changelog::Sequence;
use crate::config::MonthSyncConfig;
use crate::partition::MonthKey;
use crate::state::{NodeId, NodeSnapshot};

/// Configuration for replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Interval between background passes
    pub poll_interval: Duration,
    /// Maximum entries fetched per round trip to the primary
    pub max_batch_entries: usize,
    /// Drop log entries every replica has applied
    pub compact_change_log: bool,
    /// Close caught-up partitions unused for this long
    pub idle_close: Option<Duration>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_batch_entries: 1000,
            compact_change_log: false,
            idle_close: Some(Duration::from_secs(600)),
        }
    }
}

impl ReplicationConfig {
    pub fn from_config(config: &MonthSyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_batch_entries: config.replication.max_batch_entries.max(1),
            compact_change_log: config.replication.compact_change_log,
            idle_close: config.idle_close(),
        }
    }
}

/// Replication state of one month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub month: MonthKey,
    /// End of the last pass in which every replica caught up
    pub last_sync: Option<DateTime<Utc>>,
    /// Latest sequence minus the slowest active replica's checkpoint
    pub pending_changes: Sequence,
    pub nodes: Vec<NodeSnapshot>,
}

/// Outcome of one replica in a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaReport {
    pub node_id: NodeId,
    pub applied: u64,
    pub last_applied_sequence: Sequence,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Outcome of one partition in a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub month: MonthKey,
    pub replicas: Vec<ReplicaReport>,
    /// Log entries removed by compaction
    pub compacted: usize,
}

impl PartitionReport {
    /// Whether every replica applied everything it was sent
    pub fn is_complete(&self) -> bool {
        self.replicas.iter().all(|r| r.error.is_none())
    }

    pub fn applied(&self) -> u64 {
        self.replicas.iter().map(|r| r.applied).sum()
    }
}
