//! State Tracker
//!
//! Persistent sync markers stored inside each node file: the sequence
//! high-water mark on the primary and the applied checkpoint on replicas.
//! Markers are written through the caller's connection so they commit in
//! the same transaction as the statement they describe.

use rusqlite::{params, Connection, OptionalExtension};

use crate::changelog::Sequence;
use crate::error::Result;

const LAST_APPLIED_KEY: &str = "last_applied_sequence";
const HIGH_WATER_KEY: &str = "sequence_high_water";

/// Sync marker table DDL
pub(crate) const SYNC_STATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _sync_state (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Sync marker accessor over a borrowed connection or transaction
pub struct StateTracker<'c> {
    conn: &'c Connection,
}

impl<'c> StateTracker<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Get the last sequence applied to this node
    pub fn last_applied_sequence(&self) -> Result<Sequence> {
        self.get(LAST_APPLIED_KEY)
    }

    /// Set the last sequence applied to this node
    pub fn set_last_applied_sequence(&self, sequence: Sequence) -> Result<()> {
        self.set(LAST_APPLIED_KEY, sequence)
    }

    /// Highest sequence ever handed out by this node's generator
    pub fn sequence_high_water(&self) -> Result<Sequence> {
        self.get(HIGH_WATER_KEY)
    }

    /// Record the highest sequence handed out
    pub fn set_sequence_high_water(&self, sequence: Sequence) -> Result<()> {
        self.set(HIGH_WATER_KEY, sequence)
    }

    fn get(&self, key: &str) -> Result<Sequence> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM _sync_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) as Sequence)
    }

    fn set(&self, key: &str, sequence: Sequence) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO _sync_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, sequence as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SYNC_STATE_SCHEMA).unwrap();
        conn
    }

    #[test]
    fn test_markers_default_to_zero() {
        let conn = conn();
        let tracker = StateTracker::new(&conn);
        assert_eq!(tracker.last_applied_sequence().unwrap(), 0);
        assert_eq!(tracker.sequence_high_water().unwrap(), 0);
    }

    #[test]
    fn test_markers_are_independent() {
        let conn = conn();
        let tracker = StateTracker::new(&conn);
        tracker.set_last_applied_sequence(12).unwrap();
        tracker.set_sequence_high_water(40).unwrap();
        tracker.set_last_applied_sequence(13).unwrap();

        assert_eq!(tracker.last_applied_sequence().unwrap(), 13);
        assert_eq!(tracker.sequence_high_water().unwrap(), 40);
    }

    #[test]
    fn test_marker_rolls_back_with_transaction() {
        let mut conn = conn();
        StateTracker::new(&conn).set_last_applied_sequence(3).unwrap();

        {
            let tx = conn.transaction().unwrap();
            StateTracker::new(&tx).set_last_applied_sequence(4).unwrap();
            // dropped without commit
        }

        assert_eq!(StateTracker::new(&conn).last_applied_sequence().unwrap(), 3);
    }
}
