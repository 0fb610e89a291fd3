//! Change Log Store
//!
//! Ordered, append-only mutation log kept in the primary's file of each
//! partition. A mutation and its log row commit in one transaction, so a
//! log entry exists only for statements the primary actually applied.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::entry::{ChangeLogEntry, OperationKind, Sequence, Value};
use crate::error::{Error, Result};
use crate::executor;
use crate::partition::{MonthKey, NodeRegistry};
use crate::state::{Node, StateTracker};

/// Change log table DDL
pub(crate) const CHANGE_LOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _change_log (
    sequence INTEGER PRIMARY KEY,
    operation TEXT NOT NULL,
    sql_text TEXT NOT NULL,
    params TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Partition-scoped monotonic sequence generator
///
/// The lock is held for the whole apply of a write, so a sequence is only
/// consumed by a mutation that committed and no gaps appear.
#[derive(Debug)]
pub struct SequenceGenerator {
    last: Mutex<Sequence>,
}

impl SequenceGenerator {
    pub fn new(last: Sequence) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    /// Last sequence handed out
    pub fn current(&self) -> Sequence {
        *self.last.lock()
    }

    /// Run `commit` with the next sequence; the sequence is consumed only
    /// if `commit` succeeds
    pub fn advance<T, F>(&self, commit: F) -> Result<T>
    where
        F: FnOnce(Sequence) -> Result<T>,
    {
        let mut last = self.last.lock();
        let next = last
            .checked_add(1)
            .ok_or_else(|| Error::ChangeLog("sequence space exhausted".into()))?;
        let committed = commit(next)?;
        *last = next;
        Ok(committed)
    }
}

/// Result of a write applied on the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub sequence: Sequence,
    pub affected_rows: usize,
    /// Rowid of the inserted row, for statements that inserted one
    pub last_insert_id: Option<i64>,
}

/// Highest sequence ever assigned in this file
///
/// Takes the larger of the persisted high-water mark and the newest log row
/// so values stay unique across compaction and restarts.
pub(crate) fn latest_persisted_sequence(conn: &Connection) -> Result<Sequence> {
    let high_water = StateTracker::new(conn).sequence_high_water()?;
    let newest: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) FROM _change_log",
        [],
        |row| row.get(0),
    )?;
    Ok(high_water.max(newest as Sequence))
}

/// Apply a statement to the primary and log it under the next sequence
pub(crate) fn append_to_primary(primary: &Node, sql: &str, params: &[Value]) -> Result<WriteOutcome> {
    let generator = primary.sequence_generator()?;
    generator.advance(|sequence| {
        // Counts are read before the log insert overwrites them
        let applied = primary.with_connection(|conn| {
            let tx = conn.transaction()?;
            let applied = executor::execute_statement(&tx, sql, params)?;
            insert_entry(&tx, sequence, OperationKind::Exec, sql, params)?;
            StateTracker::new(&tx).set_sequence_high_water(sequence)?;
            tx.commit()?;
            Ok(applied)
        })?;
        primary.set_last_applied_sequence(sequence);
        Ok(WriteOutcome {
            sequence,
            affected_rows: applied.affected_rows,
            last_insert_id: applied.last_insert_id,
        })
    })
}

fn insert_entry(
    conn: &Connection,
    sequence: Sequence,
    operation: OperationKind,
    sql: &str,
    params: &[Value],
) -> Result<()> {
    let encoded = serde_json::to_string(params)?;
    conn.execute(
        "INSERT INTO _change_log (sequence, operation, sql_text, params, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            sequence as i64,
            operation.as_str(),
            sql,
            encoded,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Entries with `sequence > after`, ascending, at most `limit` of them
pub(crate) fn read_entries_after(
    conn: &Connection,
    after: Sequence,
    limit: Option<usize>,
) -> Result<Vec<ChangeLogEntry>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare_cached(
        "SELECT sequence, operation, sql_text, params, created_at FROM _change_log WHERE sequence > ?1 ORDER BY sequence ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![after as i64, limit], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (sequence, operation, sql, params, created_at) = row?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::ChangeLog(format!("bad timestamp on entry {}: {}", sequence, e)))?
            .with_timezone(&chrono::Utc);
        entries.push(ChangeLogEntry {
            sequence: sequence as Sequence,
            operation: operation.parse()?,
            sql,
            params: serde_json::from_str(&params)?,
            created_at,
        });
    }

    Ok(entries)
}

/// Delete entries with `sequence <= through`
pub(crate) fn delete_through(conn: &Connection, through: Sequence) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM _change_log WHERE sequence <= ?1",
        params![through as i64],
    )?)
}

/// Change log access by month
#[derive(Clone)]
pub struct ChangeLogStore {
    registry: Arc<NodeRegistry>,
}

impl ChangeLogStore {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Apply `sql` to the month's primary and record it
    pub async fn append(&self, month: &MonthKey, sql: &str, params: Vec<Value>) -> Result<WriteOutcome> {
        let primary = self.registry.resolve(month).await?.primary().clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || append_to_primary(&primary, &sql, &params)).await?
    }

    /// Every entry after `after`, ascending
    pub async fn entries_after(&self, month: &MonthKey, after: Sequence) -> Result<Vec<ChangeLogEntry>> {
        self.entries_after_limited(month, after, None).await
    }

    /// Entries after `after`, ascending, capped at `limit`
    pub async fn entries_after_limited(
        &self,
        month: &MonthKey,
        after: Sequence,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let primary = self.registry.resolve(month).await?.primary().clone();
        tokio::task::spawn_blocking(move || {
            primary.with_connection(|conn| read_entries_after(conn, after, limit))
        })
        .await?
    }

    /// Latest sequence assigned in the month
    pub async fn latest_sequence(&self, month: &MonthKey) -> Result<Sequence> {
        let nodes = self.registry.resolve(month).await?;
        Ok(nodes.primary().sequence_generator()?.current())
    }

    /// Drop entries up to and including `through`
    pub async fn compact(&self, month: &MonthKey, through: Sequence) -> Result<usize> {
        let primary = self.registry.resolve(month).await?.primary().clone();
        tokio::task::spawn_blocking(move || primary.with_connection(|conn| delete_through(conn, through)))
            .await?
    }
}
