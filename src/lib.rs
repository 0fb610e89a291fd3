//! MonthSync - Month-Partitioned Embedded Database Replication
//!
//! Keeps several SQLite files per calendar month in sync. Node 0 of each
//! month is the primary and takes every write; the other nodes are read
//! replicas fed from an ordered change log.
//!
//! # Architecture
//!
//! Writes commit on the primary together with a change-log row carrying a
//! gap-free sequence number. A background loop replays the log onto each
//! replica in sequence order, one transaction per entry, so a replica
//! always holds a prefix of the primary's history.
//!
//! # Features
//!
//! - Lazily created month partitions (`<data_dir>/<YYYY-MM>/node_N.db`)
//! - Strictly ordered, resumable replica catch-up
//! - Concurrent fan-out queries on a bounded pool with a global timeout
//! - Batch mutations with per-operation accounting
//! - Replication lag reporting per month

pub mod api;
pub mod batch;
pub mod changelog;
pub mod config;
pub mod error;
pub mod executor;
pub mod partition;
pub mod query;
pub mod replication;
pub mod state;
pub mod tuning;

pub use config::MonthSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{MonthSync, WriteResponse};
    pub use crate::batch::BatchResult;
    pub use crate::changelog::{Sequence, Value};
    pub use crate::config::MonthSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::partition::MonthKey;
    pub use crate::query::{AggregateResult, QueryStats};
    pub use crate::replication::SyncStatus;
}
