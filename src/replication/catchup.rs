//! Replica catch-up
//!
//! Blocking apply of change-log entries onto one replica.

use crate::changelog::{read_entries_after, ChangeLogEntry, Sequence};
use crate::error::{Error, Result};
use crate::executor;
use crate::state::{Node, StateTracker};

/// Result of catching one replica up
#[derive(Debug, Default)]
pub(crate) struct CatchUp {
    pub applied: u64,
    /// Set when the replica stopped short; progress before it is kept
    pub error: Option<Error>,
}

/// Apply one entry in its own replica transaction
///
/// The persisted checkpoint must be exactly `entry.sequence - 1`; the
/// statement and the new checkpoint commit together.
pub(crate) fn apply_entry(replica: &Node, entry: &ChangeLogEntry) -> Result<()> {
    replica.with_connection(|conn| {
        let tx = conn.transaction()?;
        let checkpoint = StateTracker::new(&tx).last_applied_sequence()?;
        if checkpoint + 1 != entry.sequence {
            return Err(Error::SequenceContinuity {
                node: replica.id(),
                expected: checkpoint + 1,
                found: entry.sequence,
            });
        }

        executor::execute_statement(&tx, &entry.sql, &entry.params)?;
        StateTracker::new(&tx).set_last_applied_sequence(entry.sequence)?;
        tx.commit()?;
        Ok(())
    })?;

    replica.set_last_applied_sequence(entry.sequence);
    Ok(())
}

/// Fetch and apply everything after the replica's checkpoint
pub(crate) fn catch_up(primary: &Node, replica: &Node, max_batch: usize) -> CatchUp {
    let mut outcome = CatchUp::default();
    if let Err(e) = run(primary, replica, max_batch, &mut outcome.applied) {
        outcome.error = Some(e);
    }
    outcome
}

fn run(primary: &Node, replica: &Node, max_batch: usize, applied: &mut u64) -> Result<()> {
    let latest: Sequence = primary.last_applied_sequence();

    loop {
        let checkpoint = replica.last_applied_sequence();
        if checkpoint > latest {
            return Err(Error::SequenceContinuity {
                node: replica.id(),
                expected: checkpoint + 1,
                found: latest,
            });
        }
        if checkpoint == latest {
            return Ok(());
        }

        let batch = primary.with_connection(|conn| read_entries_after(conn, checkpoint, Some(max_batch)))?;
        let Some(first) = batch.first() else {
            // Log rows the replica still needs are gone
            return Err(Error::SequenceContinuity {
                node: replica.id(),
                expected: checkpoint + 1,
                found: latest + 1,
            });
        };
        if first.sequence != checkpoint + 1 {
            return Err(Error::SequenceContinuity {
                node: replica.id(),
                expected: checkpoint + 1,
                found: first.sequence,
            });
        }

        for entry in &batch {
            tracing::debug!(
                node = replica.id(),
                sequence = entry.sequence,
                "Applying {}",
                entry.sql_preview()
            );
            apply_entry(replica, entry)?;
            *applied += 1;
        }

        if batch.len() < max_batch {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{append_to_primary, delete_through, Value};
    use crate::partition::MonthKey;
    use tempfile::tempdir;

    fn pair(dir: &std::path::Path) -> (Node, Node) {
        let month = MonthKey::parse("2025-03").unwrap();
        (
            Node::open(0, month.clone(), dir.join("node_0.db")),
            Node::open(1, month, dir.join("node_1.db")),
        )
    }

    fn insert_user(primary: &Node, name: &str) -> Sequence {
        append_to_primary(
            primary,
            "INSERT INTO users (name, email) VALUES (?, ?)",
            &[Value::Text(name.into()), Value::Null],
        )
        .unwrap()
        .sequence
    }

    fn user_names(node: &Node) -> Vec<Value> {
        let data = node
            .with_connection(|conn| executor::query_rows(conn, "SELECT name FROM users ORDER BY id", &[]))
            .unwrap();
        data.rows.into_iter().map(|mut r| r.remove(0)).collect()
    }

    #[test]
    fn test_catch_up_in_small_batches() {
        let dir = tempdir().unwrap();
        let (primary, replica) = pair(dir.path());
        for i in 0..5 {
            insert_user(&primary, &format!("u{}", i));
        }

        let outcome = catch_up(&primary, &replica, 2);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.applied, 5);
        assert_eq!(replica.last_applied_sequence(), 5);
        assert_eq!(user_names(&replica), user_names(&primary));

        let again = catch_up(&primary, &replica, 2);
        assert_eq!(again.applied, 0);
        assert!(again.error.is_none());
    }

    #[test]
    fn test_failure_keeps_prefix_and_resumes() {
        let dir = tempdir().unwrap();
        let (primary, replica) = pair(dir.path());
        insert_user(&primary, "a");
        append_to_primary(
            &primary,
            "INSERT INTO products (id, name, price) VALUES (?, ?, ?)",
            &[Value::Integer(7), Value::Text("widget".into()), Value::Real(2.5)],
        )
        .unwrap();
        insert_user(&primary, "b");

        replica
            .with_connection(|conn| {
                conn.execute("INSERT INTO products (id, name) VALUES (7, 'conflict')", [])?;
                Ok(())
            })
            .unwrap();

        let outcome = catch_up(&primary, &replica, 100);
        assert_eq!(outcome.applied, 1);
        assert!(matches!(outcome.error, Some(Error::Execution(_))));
        assert_eq!(replica.last_applied_sequence(), 1);
        assert_eq!(user_names(&replica), vec![Value::Text("a".into())]);

        replica
            .with_connection(|conn| {
                conn.execute("DELETE FROM products WHERE id = 7", [])?;
                Ok(())
            })
            .unwrap();

        let outcome = catch_up(&primary, &replica, 100);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.applied, 2);
        assert_eq!(replica.last_applied_sequence(), 3);
        assert_eq!(user_names(&replica), user_names(&primary));
    }

    #[test]
    fn test_out_of_order_entry_is_rejected() {
        let dir = tempdir().unwrap();
        let (primary, replica) = pair(dir.path());
        insert_user(&primary, "a");
        insert_user(&primary, "b");

        let entries = primary
            .with_connection(|conn| read_entries_after(conn, 0, None))
            .unwrap();
        let err = apply_entry(&replica, &entries[1]).unwrap_err();
        assert!(matches!(
            err,
            Error::SequenceContinuity { node: 1, expected: 1, found: 2 }
        ));
        assert_eq!(replica.last_applied_sequence(), 0);
        assert!(user_names(&replica).is_empty());
    }

    #[test]
    fn test_compacted_log_is_continuity_violation() {
        let dir = tempdir().unwrap();
        let (primary, replica) = pair(dir.path());
        for name in ["a", "b", "c"] {
            insert_user(&primary, name);
        }
        primary.with_connection(|conn| delete_through(conn, 2)).unwrap();

        let outcome = catch_up(&primary, &replica, 10);
        assert_eq!(outcome.applied, 0);
        assert!(outcome.error.unwrap().is_invariant_violation());
        assert_eq!(replica.last_applied_sequence(), 0);
    }

    #[test]
    fn test_returning_insert_replays_on_replica() {
        let dir = tempdir().unwrap();
        let (primary, replica) = pair(dir.path());
        insert_user(&primary, "a");
        let written = append_to_primary(
            &primary,
            "INSERT INTO users (name, email) VALUES (?, ?) RETURNING id",
            &[Value::Text("b".into()), Value::Text("b@x.com".into())],
        )
        .unwrap();
        assert_eq!(written.sequence, 2);
        assert_eq!(written.last_insert_id, Some(2));

        let outcome = catch_up(&primary, &replica, 10);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.applied, 2);
        assert_eq!(user_names(&replica), user_names(&primary));
    }
}
