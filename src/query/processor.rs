//! Concurrent Query Processor
//!
//! Runs one blocking query per target on a semaphore-bounded pool under a
//! single deadline. Per-node failures and timeouts are folded into the
//! aggregate; only a processor that is shutting down rejects the call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};

use super::{AggregateResult, NodeResult, QueryData, QueryStats, QueryTarget};
use crate::changelog::Value;
use crate::config::{MonthSyncConfig, ShutdownPolicy};
use crate::error::{Error, Result};
use crate::state::Node;

/// Bounded fan-out executor
pub struct ConcurrentQueryProcessor {
    permits: Arc<Semaphore>,
    pool_size: usize,
    timeout: Duration,
    policy: ShutdownPolicy,
    accepting: AtomicBool,
    cancel: watch::Sender<bool>,
    stats: Mutex<QueryStats>,
}

impl ConcurrentQueryProcessor {
    pub fn new(pool_size: usize, timeout: Duration, policy: ShutdownPolicy) -> Self {
        let pool_size = pool_size.max(1);
        let (cancel, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            timeout,
            policy,
            accepting: AtomicBool::new(true),
            cancel,
            stats: Mutex::new(QueryStats::default()),
        }
    }

    pub fn from_config(config: &MonthSyncConfig) -> Self {
        Self::new(
            config.pool_size(),
            config.query_timeout(),
            config.query.shutdown_policy,
        )
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Run `query_fn` against every target and collect one result each
    ///
    /// At most `pool_size` queries run at once. Results come back in input
    /// order; targets still running at the deadline are reported as timed
    /// out and their blocking work is left to finish unobserved.
    pub async fn execute_concurrent_query<F>(
        &self,
        query_fn: F,
        targets: Vec<QueryTarget>,
        label: &str,
    ) -> Result<AggregateResult>
    where
        F: Fn(&Node, &str, &[Value]) -> Result<QueryData> + Send + Sync + 'static,
    {
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;
        let after_ms = self.timeout.as_millis() as u64;
        let query_fn = Arc::new(query_fn);
        let mut cancelled = self.cancel.subscribe();

        let handles: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let node_id = target.node.id();
                let permits = Arc::clone(&self.permits);
                let query_fn = Arc::clone(&query_fn);
                let handle = tokio::spawn(async move {
                    let permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::ShuttingDown)?;
                    let outcome: Result<QueryData> = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        query_fn(&target.node, &target.sql, &target.params)
                    })
                    .await?;
                    outcome
                });
                (node_id, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (node_id, mut handle) in handles {
            let outcome = tokio::select! {
                joined = tokio::time::timeout_at(deadline, &mut handle) => match joined {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => Err(Error::from(e)),
                    Err(_) => {
                        handle.abort();
                        tracing::warn!(node = node_id, label, "Query timed out after {} ms", after_ms);
                        Err(Error::Timeout { node: node_id, after_ms })
                    }
                },
                _ = cancelled.wait_for(|c| *c) => {
                    handle.abort();
                    Err(Error::ShuttingDown)
                }
            };
            results.push(NodeResult::from_outcome(node_id, outcome));
        }

        let successful_nodes = results.iter().filter(|r| r.success).count();
        let failed_nodes = results.len() - successful_nodes;
        let execution_time = started.elapsed().as_secs_f64();
        self.record(failed_nodes == 0, execution_time);

        tracing::debug!(
            label,
            successful_nodes,
            failed_nodes,
            "Fan-out finished in {:.3}s",
            execution_time
        );

        Ok(AggregateResult {
            label: label.to_string(),
            results,
            successful_nodes,
            failed_nodes,
            execution_time,
        })
    }

    fn record(&self, success: bool, execution_time: f64) {
        let mut stats = self.stats.lock();
        stats.total_queries += 1;
        if success {
            stats.successful_queries += 1;
        }
        stats.avg_execution_time +=
            (execution_time - stats.avg_execution_time) / stats.total_queries as f64;
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> QueryStats {
        self.stats.lock().clone()
    }

    /// Stop accepting work, then drain or cancel what is in flight
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        match self.policy {
            ShutdownPolicy::Drain => {
                let all = self.pool_size as u32;
                match tokio::time::timeout(self.timeout, self.permits.acquire_many(all)).await {
                    Ok(_) => tracing::info!("Query pool drained"),
                    Err(_) => tracing::warn!(
                        "Query pool still busy after {:?}; abandoning in-flight work",
                        self.timeout
                    ),
                }
            }
            ShutdownPolicy::Cancel => {
                self.cancel.send_replace(true);
                tracing::info!("In-flight queries cancelled");
            }
        }

        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::MonthKey;
    use crate::state::NodeStatus;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn nodes(dir: &std::path::Path, count: usize) -> Vec<Arc<Node>> {
        let month = MonthKey::parse("2025-03").unwrap();
        (0..count)
            .map(|id| Arc::new(Node::open(id, month.clone(), dir.join(format!("node_{}.db", id)))))
            .collect()
    }

    fn targets(nodes: &[Arc<Node>], sql: &str) -> Vec<QueryTarget> {
        nodes
            .iter()
            .map(|n| QueryTarget::new(Arc::clone(n), sql, vec![]))
            .collect()
    }

    fn echo_id(node: &Node, _sql: &str, _params: &[Value]) -> Result<QueryData> {
        Ok(QueryData::new(
            vec!["id".into()],
            vec![None],
            vec![vec![Value::Integer(node.id() as i64)]],
        ))
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let dir = tempdir().unwrap();
        let nodes = nodes(dir.path(), 4);
        let processor = ConcurrentQueryProcessor::new(2, Duration::from_secs(5), ShutdownPolicy::Drain);

        let mut reversed = targets(&nodes, "SELECT 1");
        reversed.reverse();
        let result = processor
            .execute_concurrent_query(echo_id, reversed, "order")
            .await
            .unwrap();

        let ids: Vec<usize> = result.results.iter().map(|r| r.node_id).collect();
        assert_eq!(ids, vec![3, 2, 1, 0]);
        assert_eq!(result.successful_nodes, 4);
        assert_eq!(result.failed_nodes, 0);
        assert_eq!(result.results[0].data.as_ref().unwrap().rows[0][0], Value::Integer(3));
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let dir = tempdir().unwrap();
        let nodes = nodes(dir.path(), 6);
        let processor = ConcurrentQueryProcessor::new(2, Duration::from_secs(10), ShutdownPolicy::Drain);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let query_fn = move |node: &Node, sql: &str, params: &[Value]| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            r.fetch_sub(1, Ordering::SeqCst);
            echo_id(node, sql, params)
        };

        let result = processor
            .execute_concurrent_query(query_fn, targets(&nodes, "SELECT 1"), "bounded")
            .await
            .unwrap();
        assert_eq!(result.successful_nodes, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_alone() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_2.db")).unwrap();
        let nodes = nodes(dir.path(), 4);
        assert_eq!(nodes[2].status(), NodeStatus::Unreachable);

        let processor = ConcurrentQueryProcessor::new(4, Duration::from_secs(5), ShutdownPolicy::Drain);
        let result = processor
            .execute_concurrent_query(
                crate::executor::query_node,
                targets(&nodes, "SELECT COUNT(*) AS n FROM users"),
                "partial",
            )
            .await
            .unwrap();

        assert_eq!(result.results.len(), 4);
        assert_eq!(result.successful_nodes, 3);
        assert_eq!(result.failed_nodes, 1);
        assert!(!result.results[2].success);
        assert!(result.results[2].error.is_some());
        assert_eq!(result.results[0].data.as_ref().unwrap().rows, vec![vec![Value::Integer(0)]]);

        let stats = processor.stats();
        assert_eq!(stats.total_queries, 1);
        assert_eq!(stats.successful_queries, 0);
    }

    #[tokio::test]
    async fn test_deadline_times_out_slow_nodes() {
        let dir = tempdir().unwrap();
        let nodes = nodes(dir.path(), 3);
        let processor = ConcurrentQueryProcessor::new(3, Duration::from_millis(100), ShutdownPolicy::Drain);

        let query_fn = |node: &Node, sql: &str, params: &[Value]| {
            if node.id() == 1 {
                std::thread::sleep(Duration::from_millis(500));
            }
            echo_id(node, sql, params)
        };

        let result = processor
            .execute_concurrent_query(query_fn, targets(&nodes, "SELECT 1"), "slow")
            .await
            .unwrap();
        assert_eq!(result.results.len(), 3);
        assert!(result.results[0].success);
        assert!(!result.results[1].success);
        assert!(result.results[1].error.as_ref().unwrap().contains("timed out"));
        assert!(result.results[2].success);
        assert!(result.execution_time < 0.5);
    }

    #[tokio::test]
    async fn test_stats_running_average() {
        let dir = tempdir().unwrap();
        let nodes = nodes(dir.path(), 2);
        let processor = ConcurrentQueryProcessor::new(2, Duration::from_secs(5), ShutdownPolicy::Drain);

        for _ in 0..3 {
            processor
                .execute_concurrent_query(echo_id, targets(&nodes, "SELECT 1"), "stats")
                .await
                .unwrap();
        }
        let stats = processor.stats();
        assert_eq!(stats.total_queries, 3);
        assert_eq!(stats.successful_queries, 3);
        assert!(stats.avg_execution_time >= 0.0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let dir = tempdir().unwrap();
        let nodes = nodes(dir.path(), 2);
        let processor = ConcurrentQueryProcessor::new(2, Duration::from_secs(1), ShutdownPolicy::Drain);

        processor.shutdown().await;
        assert!(!processor.is_accepting());
        let err = processor
            .execute_concurrent_query(echo_id, targets(&nodes, "SELECT 1"), "late")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }

    #[tokio::test]
    async fn test_cancel_policy_stops_awaiting() {
        let dir = tempdir().unwrap();
        let nodes = nodes(dir.path(), 2);
        let processor = Arc::new(ConcurrentQueryProcessor::new(
            2,
            Duration::from_secs(10),
            ShutdownPolicy::Cancel,
        ));

        let slow = |node: &Node, sql: &str, params: &[Value]| {
            std::thread::sleep(Duration::from_millis(300));
            echo_id(node, sql, params)
        };
        let running = {
            let processor = Arc::clone(&processor);
            let targets = targets(&nodes, "SELECT 1");
            tokio::spawn(async move { processor.execute_concurrent_query(slow, targets, "cancel").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        processor.shutdown().await;

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.failed_nodes, 2);
        assert!(result.execution_time < 0.3);
    }
}
