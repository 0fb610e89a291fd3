//! Batch Mutation Executor
//!
//! Applies one statement template to many parameter tuples. Each tuple is
//! an independent write; a failing tuple is recorded and the rest continue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::changelog::{Sequence, Value};
use crate::error::Result;
use crate::partition::MonthKey;
use crate::replication::SyncCoordinator;

/// A tuple that failed, by position in the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub index: usize,
    pub message: String,
}

/// Per-operation accounting of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub errors: Vec<BatchError>,
    /// Sequences of the successful tuples, in batch order
    pub sequences: Vec<Sequence>,
}

pub struct BatchExecutor {
    coordinator: Arc<SyncCoordinator>,
}

impl BatchExecutor {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Write `sql` once per tuple, in order
    ///
    /// Fails as a whole only when the month cannot be resolved; statement
    /// errors are counted per tuple.
    pub async fn execute_batch(
        &self,
        month: &MonthKey,
        sql: &str,
        batch_params: Vec<Vec<Value>>,
    ) -> Result<BatchResult> {
        self.coordinator.registry().resolve(month).await?;

        let mut result = BatchResult {
            total_operations: batch_params.len(),
            ..BatchResult::default()
        };

        for (index, params) in batch_params.into_iter().enumerate() {
            match self.coordinator.write(month, sql, params).await {
                Ok(outcome) => {
                    result.successful_operations += 1;
                    result.sequences.push(outcome.sequence);
                }
                Err(e) => {
                    tracing::debug!(month = %month, index, "Batch operation failed: {}", e);
                    result.failed_operations += 1;
                    result.errors.push(BatchError {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        if result.failed_operations > 0 {
            tracing::warn!(
                month = %month,
                "Batch finished with {}/{} failures",
                result.failed_operations,
                result.total_operations
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::NodeRegistry;
    use crate::replication::ReplicationConfig;
    use tempfile::tempdir;

    fn executor(dir: &std::path::Path) -> BatchExecutor {
        let registry = Arc::new(NodeRegistry::new(dir.to_path_buf(), 2));
        BatchExecutor::new(Arc::new(SyncCoordinator::new(registry, ReplicationConfig::default())))
    }

    fn product(id: i64, name: &str) -> Vec<Value> {
        vec![
            Value::Integer(id),
            Value::Text(name.into()),
            Value::Real(id as f64 * 1.5),
            Value::Integer(10),
        ]
    }

    #[tokio::test]
    async fn test_duplicate_key_fails_alone() {
        let dir = tempdir().unwrap();
        let batch = executor(dir.path());
        let month = MonthKey::parse("2025-03").unwrap();

        let mut tuples: Vec<Vec<Value>> = (1..=5).map(|id| product(id, "p")).collect();
        tuples.push(product(3, "dup"));

        let result = batch
            .execute_batch(
                &month,
                "INSERT INTO products (id, name, price, stock) VALUES (?, ?, ?, ?)",
                tuples,
            )
            .await
            .unwrap();

        assert_eq!(result.total_operations, 6);
        assert_eq!(result.successful_operations, 5);
        assert_eq!(result.failed_operations, 1);
        assert_eq!(result.errors[0].index, 5);
        assert_eq!(result.sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failure_in_the_middle_does_not_stop_the_batch() {
        let dir = tempdir().unwrap();
        let batch = executor(dir.path());
        let month = MonthKey::parse("2024-12").unwrap();

        let tuples = vec![
            vec![Value::Text("a".into())],
            vec![Value::Null],
            vec![Value::Text("c".into())],
        ];
        let result = batch
            .execute_batch(&month, "INSERT INTO users (name) VALUES (?)", tuples)
            .await
            .unwrap();

        assert_eq!(result.successful_operations, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].index, 1);
        assert!(result.errors[0].message.contains("NOT NULL"));
        assert_eq!(result.sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = tempdir().unwrap();
        let batch = executor(dir.path());
        let month = MonthKey::parse("2024-12").unwrap();

        let result = batch
            .execute_batch(&month, "INSERT INTO users (name) VALUES (?)", vec![])
            .await
            .unwrap();
        assert_eq!(result, BatchResult::default());
    }
}
