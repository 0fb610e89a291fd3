//! Partition Nodes
//!
//! One node is one database file of a month partition together with its
//! connection, role, reachability and applied sequence.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::tracker::StateTracker;
use crate::changelog::{self, Sequence, SequenceGenerator};
use crate::error::{Error, Result};
use crate::executor::schema;
use crate::partition::MonthKey;

/// Node ordinal within a partition (0 is the primary)
pub type NodeId = usize;

/// How long a connection waits on a locked database file
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Role of a node in its partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Authoritative for writes
    Primary,
    /// Receives writes only through replication
    Replica,
}

impl NodeRole {
    /// Role of the node with the given ordinal
    pub fn for_ordinal(id: NodeId) -> Self {
        if id == 0 {
            NodeRole::Primary
        } else {
            NodeRole::Replica
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

/// Node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Connected and usable
    Active,
    /// File could not be opened, or the last apply against it failed
    Unreachable,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Point-in-time view of a node, as reported in sync status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub last_applied_sequence: Sequence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A database file of a month partition
pub struct Node {
    id: NodeId,
    role: NodeRole,
    month: MonthKey,
    path: PathBuf,
    /// `None` when the file could not be opened
    conn: Option<Mutex<Connection>>,
    /// Sequence generator, primary only
    sequence: Option<SequenceGenerator>,
    reachable: AtomicBool,
    last_applied: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl Node {
    /// Open (creating if needed) the node file and its schema
    ///
    /// Never fails: a file that cannot be opened yields an unreachable node
    /// that the registry replaces on a later resolve.
    pub fn open(id: NodeId, month: MonthKey, path: PathBuf) -> Self {
        let role = NodeRole::for_ordinal(id);
        match connect(&path, role) {
            Ok((conn, last_applied)) => {
                tracing::debug!(
                    month = %month,
                    node = id,
                    role = %role,
                    last_applied,
                    "Opened node file {:?}",
                    path
                );
                Self {
                    id,
                    role,
                    month,
                    path,
                    conn: Some(Mutex::new(conn)),
                    sequence: (role == NodeRole::Primary).then(|| SequenceGenerator::new(last_applied)),
                    reachable: AtomicBool::new(true),
                    last_applied: AtomicU64::new(last_applied),
                    last_error: RwLock::new(None),
                }
            }
            Err(e) => {
                tracing::warn!(month = %month, node = id, "Cannot open node file {:?}: {}", path, e);
                Self::unreachable(id, month, path, e.to_string())
            }
        }
    }

    /// A node whose file could not be opened
    pub fn unreachable(id: NodeId, month: MonthKey, path: PathBuf, reason: String) -> Self {
        Self {
            id,
            role: NodeRole::for_ordinal(id),
            month,
            path,
            conn: None,
            sequence: None,
            reachable: AtomicBool::new(false),
            last_applied: AtomicU64::new(0),
            last_error: RwLock::new(Some(reason)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    pub fn month(&self) -> &MonthKey {
        &self.month
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file was opened successfully
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn status(&self) -> NodeStatus {
        if self.is_connected() && self.reachable.load(Ordering::Acquire) {
            NodeStatus::Active
        } else {
            NodeStatus::Unreachable
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == NodeStatus::Active
    }

    /// Exclude the node from the active set until it is retried
    pub fn mark_unreachable(&self, reason: impl Into<String>) {
        *self.last_error.write() = Some(reason.into());
        self.reachable.store(false, Ordering::Release);
    }

    /// Put a connected node back into the active set
    pub fn mark_active(&self) {
        if self.is_connected() {
            *self.last_error.write() = None;
            self.reachable.store(true, Ordering::Release);
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Last sequence applied to this node (the latest sequence for the primary)
    pub fn last_applied_sequence(&self) -> Sequence {
        self.last_applied.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_applied_sequence(&self, sequence: Sequence) {
        self.last_applied.store(sequence, Ordering::Release);
    }

    /// Run `f` with exclusive access to the node's connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.as_ref().ok_or_else(|| Error::Connection {
            node: self.id,
            reason: self
                .last_error()
                .unwrap_or_else(|| "node file is not open".to_string()),
        })?;
        let mut guard = conn.lock();
        f(&mut guard)
    }

    /// The partition's sequence generator (primary only)
    pub fn sequence_generator(&self) -> Result<&SequenceGenerator> {
        if !self.is_primary() {
            return Err(Error::Internal(format!(
                "node {} of {} is not the primary",
                self.id, self.month
            )));
        }
        self.sequence.as_ref().ok_or_else(|| Error::Connection {
            node: self.id,
            reason: self
                .last_error()
                .unwrap_or_else(|| "primary file is not open".to_string()),
        })
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            role: self.role,
            status: self.status(),
            last_applied_sequence: self.last_applied_sequence(),
            error: self.last_error(),
        }
    }

    /// Close the connection, reporting the close error if any
    pub fn close(self) -> Result<()> {
        match self.conn {
            Some(conn) => conn.into_inner().close().map_err(|(_, e)| Error::Database(e)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("month", &self.month)
            .field("status", &self.status())
            .field("last_applied", &self.last_applied_sequence())
            .finish()
    }
}

/// Open the file, install the schema and read the node's sequence position
fn connect(path: &Path, role: NodeRole) -> Result<(Connection, Sequence)> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    schema::initialize_node(&conn)?;

    let position = match role {
        NodeRole::Primary => changelog::latest_persisted_sequence(&conn)?,
        NodeRole::Replica => StateTracker::new(&conn).last_applied_sequence()?,
    };
    Ok((conn, position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn month() -> MonthKey {
        MonthKey::parse("2025-03").unwrap()
    }

    #[test]
    fn test_open_creates_schema() {
        let dir = tempdir().unwrap();
        let node = Node::open(1, month(), dir.path().join("node_1.db"));

        assert!(node.is_active());
        assert_eq!(node.role(), NodeRole::Replica);
        assert_eq!(node.last_applied_sequence(), 0);

        let tables: i64 = node
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('users', 'products', '_change_log', '_sync_state')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_unopenable_file_is_unreachable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node_2.db");
        std::fs::create_dir_all(&path).unwrap();

        let node = Node::open(2, month(), path);
        assert_eq!(node.status(), NodeStatus::Unreachable);
        assert!(!node.is_connected());
        assert!(node.last_error().is_some());

        let err = node.with_connection(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Connection { node: 2, .. }));
    }

    #[test]
    fn test_mark_unreachable_and_back() {
        let dir = tempdir().unwrap();
        let node = Node::open(0, month(), dir.path().join("node_0.db"));
        assert!(node.is_primary());
        assert!(node.sequence_generator().is_ok());

        node.mark_unreachable("apply failed");
        assert_eq!(node.snapshot().status, NodeStatus::Unreachable);
        assert_eq!(node.snapshot().error.as_deref(), Some("apply failed"));

        node.mark_active();
        assert!(node.is_active());
        assert!(node.close().is_ok());
    }

    #[test]
    fn test_replica_has_no_generator() {
        let dir = tempdir().unwrap();
        let node = Node::open(3, month(), dir.path().join("node_3.db"));
        assert!(matches!(node.sequence_generator(), Err(Error::Internal(_))));
    }
}
