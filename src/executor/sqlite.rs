//! SQLite Executor
//!
//! Executes parameterized statements against a node's database file.

use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::changelog::Value;
use crate::error::{Error, Result};
use crate::query::QueryData;
use crate::state::Node;

/// First 50 characters of a statement, for error messages
fn preview(sql: &str) -> &str {
    let end = sql.char_indices().nth(50).map(|(i, _)| i).unwrap_or(sql.len());
    &sql[..end]
}

/// Whether the statement starts with INSERT or REPLACE
fn is_insert(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("");
    keyword.eq_ignore_ascii_case("insert") || keyword.eq_ignore_ascii_case("replace")
}

/// Effect of one executed statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementOutcome {
    /// Rows changed by the statement itself, as SQLite counts them
    pub affected_rows: usize,
    /// Rowid of the row the statement inserted, if it inserted one
    pub last_insert_id: Option<i64>,
}

/// Execute a single statement
///
/// Rows produced by the statement (`RETURNING`, a stray `SELECT`) are
/// stepped through and dropped.
pub fn execute_statement(conn: &Connection, sql: &str, params: &[Value]) -> Result<StatementOutcome> {
    tracing::debug!("Executing: {}", preview(sql));

    let failed = |e: rusqlite::Error| Error::Execution(format!("Failed to execute '{}...': {}", preview(sql), e));

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::Execution(format!("Failed to prepare '{}...': {}", preview(sql), e)))?;

    {
        let mut rows = stmt.query(params_from_iter(params.iter())).map_err(failed)?;
        while rows.next().map_err(failed)?.is_some() {}
    }

    // sqlite3_changes keeps the previous count across read-only statements
    let affected_rows = if stmt.readonly() { 0 } else { conn.changes() as usize };
    let last_insert_id = (affected_rows > 0 && is_insert(sql)).then(|| conn.last_insert_rowid());

    Ok(StatementOutcome {
        affected_rows,
        last_insert_id,
    })
}

/// Run a read-only query on a connection
pub fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<QueryData> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::Execution(format!("Failed to prepare '{}...': {}", preview(sql), e)))?;

    // Replicas change only through replication
    if !stmt.readonly() {
        return Err(Error::Execution(format!(
            "Refusing to run non read-only statement '{}...' as a query",
            preview(sql)
        )));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let column_types: Vec<Option<String>> = stmt
        .columns()
        .iter()
        .map(|c| c.decl_type().map(String::from))
        .collect();

    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt
        .query(params_from_iter(params.iter()))
        .map_err(|e| Error::Execution(format!("Failed to query '{}...': {}", preview(sql), e)))?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get::<_, Value>(i)?);
        }
        rows.push(values);
    }

    Ok(QueryData::new(columns, column_types, rows))
}

/// Default per-node step of a fan-out query
pub fn query_node(node: &Node, sql: &str, params: &[Value]) -> Result<QueryData> {
    node.with_connection(|conn| query_rows(conn, sql, params))
}

/// Check that the node answers a trivial query
pub fn health_check(node: &Node) -> Result<bool> {
    node.with_connection(|conn| {
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(one == 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, price REAL)")
            .unwrap();
        conn
    }

    #[test]
    fn test_execute_and_query() {
        let conn = conn();
        let affected = execute_statement(
            &conn,
            "INSERT INTO t (id, name, price) VALUES (?, ?, ?)",
            &[Value::Integer(1), Value::Text("A".into()), Value::Real(9.5)],
        )
        .unwrap();
        assert_eq!(affected.affected_rows, 1);
        assert_eq!(affected.last_insert_id, Some(1));

        let data = query_rows(&conn, "SELECT id, name, price FROM t WHERE id = ?", &[Value::Integer(1)])
            .unwrap();
        assert_eq!(data.columns, vec!["id", "name", "price"]);
        assert_eq!(data.column_types[1].as_deref(), Some("TEXT"));
        assert_eq!(data.count, 1);
        assert_eq!(data.rows[0][1], Value::Text("A".into()));
        assert_eq!(data.rows[0][2], Value::Real(9.5));
    }

    #[test]
    fn test_query_rejects_writes() {
        let conn = conn();
        let err = query_rows(&conn, "DELETE FROM t", &[]).unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[test]
    fn test_execute_reports_constraint_violation() {
        let conn = conn();
        execute_statement(&conn, "INSERT INTO t (id) VALUES (?)", &[Value::Integer(1)]).unwrap();
        let err = execute_statement(&conn, "INSERT INTO t (id) VALUES (?)", &[Value::Integer(1)])
            .unwrap_err();
        match err {
            Error::Execution(msg) => assert!(msg.contains("UNIQUE")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parameter_count_mismatch_is_execution_error() {
        let conn = conn();
        let err = execute_statement(&conn, "INSERT INTO t (id, name) VALUES (?, ?)", &[Value::Integer(1)])
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }

    #[test]
    fn test_returning_insert_drains_rows() {
        let conn = conn();
        let outcome = execute_statement(
            &conn,
            "INSERT INTO t (name, price) VALUES (?, ?) RETURNING id",
            &[Value::Text("A".into()), Value::Real(2.0)],
        )
        .unwrap();
        assert_eq!(outcome.affected_rows, 1);
        assert_eq!(outcome.last_insert_id, Some(1));

        let data = query_rows(&conn, "SELECT name FROM t", &[]).unwrap();
        assert_eq!(data.rows, vec![vec![Value::Text("A".into())]]);
    }

    #[test]
    fn test_update_without_match_changes_nothing() {
        let conn = conn();
        execute_statement(&conn, "INSERT INTO t (id, name) VALUES (?, ?)", &[Value::Integer(7), "A".into()]).unwrap();

        let missed = execute_statement(
            &conn,
            "UPDATE t SET price = ? WHERE name = ?",
            &[Value::Real(1.0), Value::Text("nobody".into())],
        )
        .unwrap();
        assert_eq!(missed, StatementOutcome::default());

        let hit = execute_statement(&conn, "UPDATE t SET price = ? WHERE id = ?", &[Value::Real(1.0), Value::Integer(7)])
            .unwrap();
        assert_eq!(hit.affected_rows, 1);
        assert_eq!(hit.last_insert_id, None);

        let read = execute_statement(&conn, "SELECT * FROM t", &[]).unwrap();
        assert_eq!(read.affected_rows, 0);
    }

    #[test]
    fn test_inserted_id_reported_when_rowid_repeats() {
        let conn = conn();
        conn.execute_batch("CREATE TABLE u (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        execute_statement(&conn, "INSERT INTO t (name) VALUES (?)", &[Value::Text("a".into())]).unwrap();

        let outcome = execute_statement(&conn, "  insert into u (name) values (?)", &[Value::Text("b".into())]).unwrap();
        assert_eq!(outcome.last_insert_id, Some(1));

        let replaced = execute_statement(&conn, "REPLACE INTO u (id, name) VALUES (1, 'c')", &[]).unwrap();
        assert_eq!(replaced.last_insert_id, Some(1));
        assert!(!is_insert("UPDATE u SET name = 'insert'"));
    }
}
