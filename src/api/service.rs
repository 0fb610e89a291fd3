//! MonthSync service
//!
//! Wires the registry, coordinator, batch executor and query processor
//! together behind the request-level operations. Every `month` argument is
//! optional and defaults to the current local month.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use super::{HealthReport, NodeHealth, WriteResponse};
use crate::batch::{BatchExecutor, BatchResult};
use crate::changelog::Value;
use crate::config::MonthSyncConfig;
use crate::error::Result;
use crate::executor::{self, schema, ColumnDef, TableInfo, TableSchema};
use crate::partition::{CloseReport, MonthKey, NodeRegistry};
use crate::query::{AggregateResult, ConcurrentQueryProcessor, QueryJob, QueryJobStore, QueryStats, QueryTarget};
use crate::replication::{ReplicationConfig, ReplicationHandle, SyncCoordinator, SyncStatus};

/// Month-partitioned replicated store
pub struct MonthSync {
    config: MonthSyncConfig,
    registry: Arc<NodeRegistry>,
    coordinator: Arc<SyncCoordinator>,
    batch: BatchExecutor,
    processor: Arc<ConcurrentQueryProcessor>,
    jobs: Arc<QueryJobStore>,
    replication: tokio::sync::Mutex<Option<ReplicationHandle>>,
    started: Instant,
}

impl MonthSync {
    /// Create the service; no partition is opened until first use
    pub fn new(config: MonthSyncConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.data_dir())?;

        let registry = Arc::new(NodeRegistry::new(
            config.data_dir().clone(),
            config.storage.node_count,
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&registry),
            ReplicationConfig::from_config(&config),
        ));
        let processor = Arc::new(ConcurrentQueryProcessor::from_config(&config));

        tracing::info!(
            data_dir = ?config.data_dir(),
            nodes = config.storage.node_count,
            pool_size = processor.pool_size(),
            "MonthSync initialized"
        );

        Ok(Self {
            batch: BatchExecutor::new(Arc::clone(&coordinator)),
            jobs: Arc::new(QueryJobStore::new(config.job_ttl())),
            replication: tokio::sync::Mutex::new(None),
            started: Instant::now(),
            config,
            registry,
            coordinator,
            processor,
        })
    }

    pub fn config(&self) -> &MonthSyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Start the background replication loop; false if already running
    pub async fn start_replication(&self) -> bool {
        let mut slot = self.replication.lock().await;
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return false;
        }
        *slot = Some(self.coordinator.start());
        true
    }

    /// Stop the replication loop if it is running
    pub async fn stop_replication(&self) {
        if let Some(handle) = self.replication.lock().await.take() {
            handle.stop().await;
        }
    }

    /// Execute a mutation on the month's primary
    pub async fn write(&self, month: Option<&str>, sql: &str, params: Vec<Value>) -> Result<WriteResponse> {
        let month = MonthKey::or_current(month)?;
        let outcome = self.coordinator.write(&month, sql, params).await?;
        Ok(WriteResponse {
            sequence: outcome.sequence,
            month,
            affected_rows: outcome.affected_rows,
            last_insert_id: outcome.last_insert_id,
        })
    }

    /// Execute one statement per parameter tuple
    pub async fn execute_batch(
        &self,
        month: Option<&str>,
        sql: &str,
        batch_params: Vec<Vec<Value>>,
    ) -> Result<BatchResult> {
        let month = MonthKey::or_current(month)?;
        self.batch.execute_batch(&month, sql, batch_params).await
    }

    /// Run a read-only query on every node of the month
    pub async fn execute_concurrent_query(
        &self,
        sql: &str,
        params: Vec<Value>,
        month: Option<&str>,
    ) -> Result<AggregateResult> {
        let month = MonthKey::or_current(month)?;
        fan_out(&self.registry, &self.processor, &month, sql, params).await
    }

    /// Start a fan-out query in the background and return its id
    pub async fn submit_query(&self, sql: &str, params: Vec<Value>, month: Option<&str>) -> Result<Uuid> {
        let month = MonthKey::or_current(month)?;
        if !self.processor.is_accepting() {
            return Err(crate::Error::ShuttingDown);
        }

        let query_id = self.jobs.insert_pending(sql, params.clone(), month.clone());
        let registry = Arc::clone(&self.registry);
        let processor = Arc::clone(&self.processor);
        let jobs = Arc::clone(&self.jobs);
        let sql = sql.to_string();
        tokio::spawn(async move {
            let outcome = fan_out(&registry, &processor, &month, &sql, params).await;
            jobs.complete(query_id, outcome);
        });

        tracing::debug!(%query_id, "Query job submitted");
        Ok(query_id)
    }

    /// Fetch a query job; a completed job is handed out once
    pub fn query_result(&self, query_id: &Uuid) -> Option<QueryJob> {
        self.jobs.take(query_id)
    }

    pub async fn get_sync_status(&self, month: Option<&str>) -> Result<SyncStatus> {
        let month = MonthKey::or_current(month)?;
        self.coordinator.get_sync_status(&month).await
    }

    pub fn get_stats(&self) -> QueryStats {
        self.processor.stats()
    }

    /// Months that have partition files on disk
    pub fn available_months(&self) -> Result<Vec<MonthKey>> {
        self.registry.available_months()
    }

    /// User tables of the month's primary with row counts
    pub async fn list_tables(&self, month: Option<&str>) -> Result<Vec<TableInfo>> {
        let month = MonthKey::or_current(month)?;
        let primary = Arc::clone(self.registry.resolve(&month).await?.primary());
        tokio::task::spawn_blocking(move || primary.with_connection(|conn| schema::list_tables(conn))).await?
    }

    /// Columns of a table on the month's primary; empty if it does not exist
    pub async fn table_schema(&self, month: Option<&str>, table: &str) -> Result<TableSchema> {
        let month = MonthKey::or_current(month)?;
        let primary = Arc::clone(self.registry.resolve(&month).await?.primary());
        let table = table.to_string();
        tokio::task::spawn_blocking(move || primary.with_connection(|conn| schema::describe_table(conn, &table)))
            .await?
    }

    /// Create a table through the change log so replicas get it too
    pub async fn create_table(
        &self,
        month: Option<&str>,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<WriteResponse> {
        let ddl = schema::create_table_sql(table, columns)?;
        tracing::info!(table, "Creating table");
        self.write(month, &ddl, Vec::new()).await
    }

    /// Probe every node of the month
    pub async fn health(&self, month: Option<&str>) -> Result<HealthReport> {
        let month = MonthKey::or_current(month)?;
        let nodes = self.registry.resolve(&month).await?;

        let mut report = Vec::with_capacity(nodes.len());
        for node in nodes.iter() {
            let target = Arc::clone(node);
            let outcome = tokio::task::spawn_blocking(move || executor::health_check(&target)).await?;
            let (healthy, error) = match outcome {
                Ok(healthy) => (healthy, None),
                Err(e) => (false, Some(e.to_string())),
            };
            report.push(NodeHealth {
                id: node.id(),
                role: node.role(),
                healthy,
                error,
            });
        }

        let replication_running = self
            .replication
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);

        Ok(HealthReport {
            healthy: report.first().map(|n| n.healthy).unwrap_or(false),
            month,
            nodes: report,
            replication_running,
            uptime_seconds: self.started.elapsed().as_secs(),
        })
    }

    /// Stop replication, settle in-flight queries and close every node file
    pub async fn shutdown(&self) -> CloseReport {
        tracing::info!("Shutting down");
        self.stop_replication().await;
        self.processor.shutdown().await;
        self.registry.close().await
    }
}

/// Fan `sql` out to every node of the month
async fn fan_out(
    registry: &NodeRegistry,
    processor: &ConcurrentQueryProcessor,
    month: &MonthKey,
    sql: &str,
    params: Vec<Value>,
) -> Result<AggregateResult> {
    let nodes = registry.resolve(month).await?;
    let targets = nodes
        .iter()
        .map(|node| QueryTarget::new(Arc::clone(node), sql, params.clone()))
        .collect();
    processor
        .execute_concurrent_query(executor::query_node, targets, &format!("month:{}", month))
        .await
}
