//! Change Log Module
//!
//! Ordered record of every mutation applied to a partition's primary,
//! replayed in sequence order on the replicas.

pub mod entry;
mod store;

pub use entry::{ChangeLogEntry, OperationKind, Sequence, Value};
pub use store::{ChangeLogStore, SequenceGenerator, WriteOutcome};
pub(crate) use store::{
    append_to_primary, delete_through, latest_persisted_sequence, read_entries_after,
    CHANGE_LOG_SCHEMA,
};
