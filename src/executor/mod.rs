//! Database Executor Module
//!
//! Runs statements and queries against node database files.

mod sqlite;
pub mod schema;

pub use sqlite::{execute_statement, health_check, query_node, query_rows, StatementOutcome};
pub use schema::{ColumnDef, ColumnSchema, TableInfo, TableSchema};
