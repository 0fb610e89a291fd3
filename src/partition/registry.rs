//! Node Registry
//!
//! Lazily opens and caches the node files of each month partition.
//! Caught-up partitions nobody has used for a while can be closed again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::{MonthKey, PartitionPaths};
use crate::error::{Error, Result};
use crate::state::{Node, NodeId};

/// Open nodes of one month
struct Partition {
    slots: RwLock<Vec<Arc<Node>>>,
    /// Serializes opening and reopening of this month's files
    resolve_lock: tokio::sync::Mutex<()>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    /// Last resolve on behalf of a caller; replication passes do not count
    last_used: Mutex<Option<Instant>>,
}

impl Partition {
    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            resolve_lock: tokio::sync::Mutex::new(()),
            last_sync: RwLock::new(None),
            last_used: Mutex::new(None),
        }
    }

    fn idle_for_at_least(&self, idle: Duration) -> bool {
        self.last_used.lock().map_or(true, |used| used.elapsed() >= idle)
    }
}

/// Open, unshared, and every replica at the primary's sequence
fn is_settled(nodes: &[Arc<Node>]) -> bool {
    let Some(primary) = nodes.first() else {
        return false;
    };
    let latest = primary.last_applied_sequence();
    nodes
        .iter()
        .all(|n| n.is_connected() && Arc::strong_count(n) == 1 && n.last_applied_sequence() == latest)
}

/// Ordered node handles of a month, node 0 first
#[derive(Debug, Clone)]
pub struct NodeSet {
    month: MonthKey,
    nodes: Vec<Arc<Node>>,
}

impl NodeSet {
    pub fn month(&self) -> &MonthKey {
        &self.month
    }

    /// Node 0, the authoritative copy
    pub fn primary(&self) -> &Arc<Node> {
        &self.nodes[0]
    }

    /// Nodes 1..N in ordinal order
    pub fn replicas(&self) -> &[Arc<Node>] {
        &self.nodes[1..]
    }

    /// Nodes currently usable for queries
    pub fn active(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().filter(|n| n.is_active()).cloned().collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.iter()
    }
}

/// Outcome of closing the registry
#[derive(Debug, Default, Clone, Serialize)]
pub struct CloseReport {
    /// Connections closed cleanly
    pub closed: usize,
    /// Nodes still referenced elsewhere; closed when the last handle drops
    pub deferred: usize,
    pub errors: Vec<(MonthKey, NodeId, String)>,
}

/// Month partition registry
///
/// A month's `node_count` connections stay open from its first resolve
/// until `evict_if_idle` or `close`. Evicted months keep their map entry
/// (sync time only, no connections) and reopen on the next resolve.
pub struct NodeRegistry {
    paths: PartitionPaths,
    node_count: usize,
    partitions: Mutex<HashMap<MonthKey, Arc<Partition>>>,
    closed: AtomicBool,
}

impl NodeRegistry {
    /// Create a registry rooted at `base_dir`; nothing is opened yet
    pub fn new(base_dir: PathBuf, node_count: usize) -> Self {
        Self {
            paths: PartitionPaths::new(base_dir),
            node_count: node_count.max(1),
            partitions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn paths(&self) -> &PartitionPaths {
        &self.paths
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    fn partition(&self, month: &MonthKey) -> Arc<Partition> {
        let mut partitions = self.partitions.lock();
        Arc::clone(
            partitions
                .entry(month.clone())
                .or_insert_with(|| Arc::new(Partition::new())),
        )
    }

    /// Node handles for a month, opening its files on first use
    ///
    /// Files that failed to open earlier are retried here, so a node that
    /// becomes reachable again rejoins the partition.
    pub async fn resolve(&self, month: &MonthKey) -> Result<NodeSet> {
        self.open(month, true).await
    }

    /// Like `resolve`, without marking the month as in use
    pub(crate) async fn resolve_for_replication(&self, month: &MonthKey) -> Result<NodeSet> {
        self.open(month, false).await
    }

    async fn open(&self, month: &MonthKey, touch: bool) -> Result<NodeSet> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let partition = self.partition(month);
        let _guard = partition.resolve_lock.lock().await;
        if touch {
            *partition.last_used.lock() = Some(Instant::now());
        }

        let missing: Vec<NodeId> = {
            let slots = partition.slots.read();
            if slots.is_empty() {
                (0..self.node_count).collect()
            } else {
                slots
                    .iter()
                    .filter(|n| !n.is_connected())
                    .map(|n| n.id())
                    .collect()
            }
        };

        if !missing.is_empty() {
            let paths = self.paths.clone();
            let key = month.clone();
            let first_open = partition.slots.read().is_empty();
            let opened = tokio::task::spawn_blocking(move || -> Result<Vec<Node>> {
                paths.ensure_month_dir(&key)?;
                Ok(missing
                    .into_iter()
                    .map(|id| Node::open(id, key.clone(), paths.node_path(&key, id)))
                    .collect())
            })
            .await??;

            let mut slots = partition.slots.write();
            if first_open {
                tracing::info!(month = %month, nodes = opened.len(), "Opened partition");
                *slots = opened.into_iter().map(Arc::new).collect();
            } else {
                for node in opened {
                    if node.is_connected() {
                        tracing::info!(month = %month, node = node.id(), "Node file reopened");
                    }
                    let id = node.id();
                    slots[id] = Arc::new(node);
                }
            }
        }

        let nodes = partition.slots.read().clone();
        Ok(NodeSet {
            month: month.clone(),
            nodes,
        })
    }

    /// Handles of an already opened month, without touching the disk
    pub fn resolved(&self, month: &MonthKey) -> Option<NodeSet> {
        let partition = self.partitions.lock().get(month).cloned()?;
        let nodes = partition.slots.read().clone();
        if nodes.is_empty() {
            return None;
        }
        Some(NodeSet {
            month: month.clone(),
            nodes,
        })
    }

    /// Months opened in this process, ascending
    pub fn partitions(&self) -> Vec<MonthKey> {
        let mut months: Vec<MonthKey> = self
            .partitions
            .lock()
            .iter()
            .filter(|(_, p)| !p.slots.read().is_empty())
            .map(|(m, _)| m.clone())
            .collect();
        months.sort();
        months
    }

    /// Months with a partition directory on disk, ascending
    pub fn available_months(&self) -> Result<Vec<MonthKey>> {
        self.paths.list_months()
    }

    /// Record a completed replication pass for the month
    pub fn record_sync(&self, month: &MonthKey) {
        if let Some(partition) = self.partitions.lock().get(month) {
            *partition.last_sync.write() = Some(Utc::now());
        }
    }

    pub fn last_sync(&self, month: &MonthKey) -> Option<DateTime<Utc>> {
        self.partitions
            .lock()
            .get(month)
            .and_then(|p| *p.last_sync.read())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close a month's files if it is caught up and unused for `idle`
    ///
    /// Skipped while any node handle is held elsewhere, a node is not
    /// open, or a replica lags the primary. Returns whether it was closed.
    pub async fn evict_if_idle(&self, month: &MonthKey, idle: Duration) -> bool {
        let Some(partition) = self.partitions.lock().get(month).cloned() else {
            return false;
        };
        let _guard = partition.resolve_lock.lock().await;

        let nodes = {
            let mut slots = partition.slots.write();
            if slots.is_empty() || !partition.idle_for_at_least(idle) || !is_settled(&slots) {
                return false;
            }
            std::mem::take(&mut *slots)
        };

        let closing: Vec<Node> = nodes.into_iter().filter_map(|n| Arc::try_unwrap(n).ok()).collect();
        let count = closing.len();
        let closed = tokio::task::spawn_blocking(move || {
            closing.into_iter().try_for_each(Node::close)
        })
        .await;
        match closed {
            Ok(Ok(())) => tracing::info!(month = %month, nodes = count, "Closed idle partition"),
            Ok(Err(e)) => tracing::warn!(month = %month, "Error closing idle partition: {}", e),
            Err(e) => tracing::warn!(month = %month, "Error closing idle partition: {}", e),
        }
        true
    }

    /// Close every open node file; later resolves fail with `ShuttingDown`
    pub async fn close(&self) -> CloseReport {
        self.closed.store(true, Ordering::Release);
        let partitions: Vec<(MonthKey, Arc<Partition>)> = self.partitions.lock().drain().collect();

        let mut report = CloseReport::default();
        for (month, partition) in partitions {
            let _guard = partition.resolve_lock.lock().await;
            let nodes = std::mem::take(&mut *partition.slots.write());
            for node in nodes {
                match Arc::try_unwrap(node) {
                    Ok(node) => {
                        let id = node.id();
                        match tokio::task::spawn_blocking(move || node.close()).await {
                            Ok(Ok(())) => report.closed += 1,
                            Ok(Err(e)) => report.errors.push((month.clone(), id, e.to_string())),
                            Err(e) => report.errors.push((month.clone(), id, e.to_string())),
                        }
                    }
                    Err(_) => report.deferred += 1,
                }
            }
        }

        for (month, id, reason) in &report.errors {
            tracing::warn!(month = %month, node = id, "Error closing node file: {}", reason);
        }
        tracing::info!(
            closed = report.closed,
            deferred = report.deferred,
            errors = report.errors.len(),
            "Node registry closed"
        );
        report
    }
}
