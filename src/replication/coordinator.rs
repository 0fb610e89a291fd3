//! Sync Coordinator
//!
//! Accepts writes for the primary of a month and runs the background loop
//! that brings the replicas up to date.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::catchup::catch_up;
use super::{PartitionReport, ReplicaReport, ReplicationConfig, SyncStatus};
use crate::changelog::{delete_through, ChangeLogStore, Value, WriteOutcome};
use crate::error::{Error, Result};
use crate::partition::{MonthKey, NodeRegistry};

/// Write path and replication driver
///
/// Writes return once the primary has committed; replicas follow on the
/// next pass. A query against a replica while a pass is running may see
/// only part of the entries that pass applies.
pub struct SyncCoordinator {
    registry: Arc<NodeRegistry>,
    changelog: ChangeLogStore,
    config: ReplicationConfig,
    /// One pass at a time per month
    pass_locks: Mutex<HashMap<MonthKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Months closed while caught up; only a resolve can change them again
    settled: Mutex<HashSet<MonthKey>>,
}

impl SyncCoordinator {
    pub fn new(registry: Arc<NodeRegistry>, config: ReplicationConfig) -> Self {
        Self {
            changelog: ChangeLogStore::new(Arc::clone(&registry)),
            registry,
            config,
            pass_locks: Mutex::new(HashMap::new()),
            settled: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn changelog(&self) -> &ChangeLogStore {
        &self.changelog
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Apply a statement on the month's primary and log it
    pub async fn write(&self, month: &MonthKey, sql: &str, params: Vec<Value>) -> Result<WriteOutcome> {
        let outcome = self.changelog.append(month, sql, params).await?;
        tracing::debug!(
            month = %month,
            sequence = outcome.sequence,
            affected_rows = outcome.affected_rows,
            "Write committed on primary"
        );
        Ok(outcome)
    }

    /// Current replication state of a month
    pub async fn get_sync_status(&self, month: &MonthKey) -> Result<SyncStatus> {
        let nodes = self.registry.resolve(month).await?;
        let latest = nodes.primary().last_applied_sequence();
        let pending_changes = nodes
            .replicas()
            .iter()
            .filter(|n| n.is_active())
            .map(|n| n.last_applied_sequence())
            .min()
            .map(|slowest| latest.saturating_sub(slowest))
            .unwrap_or(0);

        Ok(SyncStatus {
            month: month.clone(),
            last_sync: self.registry.last_sync(month),
            pending_changes,
            nodes: nodes.iter().map(|n| n.snapshot()).collect(),
        })
    }

    fn pass_lock(&self, month: &MonthKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.pass_locks.lock().entry(month.clone()).or_default())
    }

    /// Bring every replica of one month up to the primary
    pub async fn replicate_partition(&self, month: &MonthKey) -> Result<PartitionReport> {
        let lock = self.pass_lock(month);
        let _pass = lock.lock().await;

        let nodes = self.registry.resolve_for_replication(month).await?;
        let primary = Arc::clone(nodes.primary());
        if !primary.is_connected() {
            return Err(Error::Connection {
                node: primary.id(),
                reason: primary
                    .last_error()
                    .unwrap_or_else(|| "primary file is not open".to_string()),
            });
        }

        // Apply failures only exclude a replica until the next pass
        for replica in nodes.replicas() {
            replica.mark_active();
        }

        let mut replicas = Vec::with_capacity(nodes.replicas().len());
        for replica in nodes.replicas() {
            if !replica.is_connected() {
                replicas.push(ReplicaReport {
                    node_id: replica.id(),
                    applied: 0,
                    last_applied_sequence: replica.last_applied_sequence(),
                    error: replica.last_error(),
                });
                continue;
            }

            let (p, r) = (Arc::clone(&primary), Arc::clone(replica));
            let max_batch = self.config.max_batch_entries;
            let outcome = tokio::task::spawn_blocking(move || catch_up(&p, &r, max_batch)).await?;

            if outcome.applied > 0 {
                tracing::info!(
                    month = %month,
                    node = replica.id(),
                    applied = outcome.applied,
                    "Replica now at sequence {}",
                    replica.last_applied_sequence()
                );
            }
            if let Some(e) = &outcome.error {
                if e.is_invariant_violation() {
                    tracing::error!(month = %month, node = replica.id(), "Replication halted: {}", e);
                } else {
                    tracing::warn!(month = %month, node = replica.id(), "Replica apply failed: {}", e);
                }
                replica.mark_unreachable(e.to_string());
            }

            replicas.push(ReplicaReport {
                node_id: replica.id(),
                applied: outcome.applied,
                last_applied_sequence: replica.last_applied_sequence(),
                error: outcome.error.map(|e| e.to_string()),
            });
        }

        let mut report = PartitionReport {
            month: month.clone(),
            replicas,
            compacted: 0,
        };
        if report.is_complete() {
            self.registry.record_sync(month);
        }

        if self.config.compact_change_log {
            // Unopened replicas report 0 and hold compaction back
            if let Some(through) = nodes.replicas().iter().map(|n| n.last_applied_sequence()).min() {
                if through > 0 {
                    let p = Arc::clone(&primary);
                    report.compacted =
                        tokio::task::spawn_blocking(move || p.with_connection(|conn| delete_through(conn, through)))
                            .await??;
                    if report.compacted > 0 {
                        tracing::debug!(month = %month, through, "Compacted {} log entries", report.compacted);
                    }
                }
            }
        }

        Ok(report)
    }

    /// One pass over every opened month and every on-disk month not
    /// already closed in a caught-up state
    pub async fn replicate_once(&self) -> Result<Vec<PartitionReport>> {
        if self.registry.is_closed() {
            return Err(Error::ShuttingDown);
        }

        let mut months: BTreeSet<MonthKey> = self.registry.partitions().into_iter().collect();
        let on_disk = self.registry.available_months()?;
        {
            let settled = self.settled.lock();
            months.extend(on_disk.into_iter().filter(|m| !settled.contains(m)));
        }

        let passes = months.iter().map(|month| self.replicate_partition(month));
        let outcomes = futures::future::join_all(passes).await;

        let mut reports = Vec::with_capacity(outcomes.len());
        for (month, outcome) in months.iter().zip(outcomes) {
            match outcome {
                Ok(report) => reports.push(report),
                Err(Error::ShuttingDown) => return Err(Error::ShuttingDown),
                Err(e) => tracing::warn!(month = %month, "Replication pass failed: {}", e),
            }
        }

        if let Some(idle) = self.config.idle_close {
            for report in reports.iter().filter(|r| r.is_complete()) {
                if self.registry.evict_if_idle(&report.month, idle).await {
                    self.settled.lock().insert(report.month.clone());
                }
            }
        }
        Ok(reports)
    }

    /// Spawn the background replication loop
    pub fn start(self: &Arc<Self>) -> ReplicationHandle {
        let (shutdown, mut stop_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                "Replication loop started (interval {:?})",
                coordinator.config.poll_interval
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => match coordinator.replicate_once().await {
                        Ok(reports) => {
                            let applied: u64 = reports.iter().map(|r| r.applied()).sum();
                            if applied > 0 {
                                tracing::debug!(partitions = reports.len(), applied, "Replication pass done");
                            }
                        }
                        Err(Error::ShuttingDown) => break,
                        Err(e) => tracing::warn!("Replication pass failed: {}", e),
                    },
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Replication loop stopped");
        });

        ReplicationHandle { shutdown, task }
    }
}

/// Handle to the running replication loop
pub struct ReplicationHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReplicationHandle {
    /// Signal the loop and wait for the current pass to finish
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::error!("Replication loop ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
