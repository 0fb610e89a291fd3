//! Concurrent Query Module
//!
//! Fans a read-only statement out to the nodes of a partition on a bounded
//! worker pool and aggregates one result per node.

mod jobs;
mod processor;

pub use jobs::{QueryJob, QueryJobStore};
pub use processor::ConcurrentQueryProcessor;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::changelog::Value;
use crate::error::Result;
use crate::state::{Node, NodeId};

/// Rows returned by one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryData {
    pub columns: Vec<String>,
    /// Declared column types; `None` for expressions
    pub column_types: Vec<Option<String>>,
    pub rows: Vec<Vec<Value>>,
    pub count: usize,
}

impl QueryData {
    pub fn new(columns: Vec<String>, column_types: Vec<Option<String>>, rows: Vec<Vec<Value>>) -> Self {
        let count = rows.len();
        Self {
            columns,
            column_types,
            rows,
            count,
        }
    }
}

/// One unit of fan-out work
#[derive(Debug, Clone)]
pub struct QueryTarget {
    pub node: Arc<Node>,
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryTarget {
    pub fn new(node: Arc<Node>, sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            node,
            sql: sql.into(),
            params,
        }
    }
}

/// Outcome of one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<QueryData>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl NodeResult {
    pub fn from_outcome(node_id: NodeId, outcome: Result<QueryData>) -> Self {
        match outcome {
            Ok(data) => Self {
                node_id,
                success: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self {
                node_id,
                success: false,
                data: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Aggregated fan-out result, one entry per target in input order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub label: String,
    pub results: Vec<NodeResult>,
    pub successful_nodes: usize,
    pub failed_nodes: usize,
    /// Wall time in seconds
    pub execution_time: f64,
}

impl AggregateResult {
    /// Results that carry data
    pub fn successes(&self) -> impl Iterator<Item = &NodeResult> {
        self.results.iter().filter(|r| r.success)
    }
}

/// Fan-out statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub total_queries: u64,
    /// Queries in which every node succeeded
    pub successful_queries: u64,
    /// Running mean in seconds
    pub avg_execution_time: f64,
}
