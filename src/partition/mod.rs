//! Monthly Partition Module
//!
//! Maps a `YYYY-MM` month key onto an isolated directory holding one
//! database file per node ordinal, and keeps the open node handles for
//! each partition.

mod registry;

pub use registry::{CloseReport, NodeRegistry, NodeSet};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::NodeId;

/// Validated month partition key (`YYYY-MM`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey(String);

impl MonthKey {
    /// Parse and validate a month key
    pub fn parse(raw: &str) -> Result<Self> {
        let bytes = raw.as_bytes();
        let well_formed = bytes.len() == 7
            && bytes[4] == b'-'
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[5..].iter().all(u8::is_ascii_digit);
        if !well_formed {
            return Err(Error::InvalidMonth(raw.to_string()));
        }

        let month: u32 = raw[5..]
            .parse()
            .map_err(|_| Error::InvalidMonth(raw.to_string()))?;
        if !(1..=12).contains(&month) {
            return Err(Error::InvalidMonth(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    /// The current local calendar month
    pub fn current() -> Self {
        Self(chrono::Local::now().format("%Y-%m").to_string())
    }

    /// Resolve an optional key, defaulting to the current month
    pub fn or_current(raw: Option<&str>) -> Result<Self> {
        match raw {
            Some(raw) => Self::parse(raw),
            None => Ok(Self::current()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MonthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for MonthKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MonthKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.0
    }
}

/// Partition directory structure
#[derive(Debug, Clone)]
pub struct PartitionPaths {
    pub base_dir: PathBuf,
}

impl PartitionPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Directory holding all node files of a month
    pub fn month_dir(&self, month: &MonthKey) -> PathBuf {
        self.base_dir.join(month.as_str())
    }

    /// Database file of one node in a month
    pub fn node_path(&self, month: &MonthKey, node: NodeId) -> PathBuf {
        self.month_dir(month).join(format!("node_{}.db", node))
    }

    /// Ensure the month directory exists
    pub fn ensure_month_dir(&self, month: &MonthKey) -> std::io::Result<()> {
        std::fs::create_dir_all(self.month_dir(month))
    }

    /// Months with a partition directory on disk, ascending
    pub fn list_months(&self) -> Result<Vec<MonthKey>> {
        list_months(&self.base_dir)
    }
}

fn list_months(base_dir: &Path) -> Result<Vec<MonthKey>> {
    if !base_dir.exists() {
        return Ok(Vec::new());
    }

    let mut months = Vec::new();
    for entry in std::fs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(month) = entry.file_name().to_str().and_then(|n| MonthKey::parse(n).ok()) {
            months.push(month);
        }
    }
    months.sort();
    Ok(months)
}
