//! MonthSync Configuration
//!
//! This module provides configuration structures for the partition
//! registry, the replication loop and the query processor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main MonthSync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonthSyncConfig {
    /// Partition storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Replication loop configuration
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Fan-out query configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Partition storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one sub-directory per month
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database files per partition; node 0 is the primary
    #[serde(default = "default_node_count")]
    pub node_count: usize,
}

/// Replication loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Interval between replication passes in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum change-log entries fetched per replica round trip
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    /// Drop change-log entries every replica has applied
    #[serde(default)]
    pub compact_change_log: bool,

    /// Close a caught-up partition after this many seconds without use (0 = never)
    #[serde(default = "default_idle_close_secs")]
    pub idle_close_secs: u64,
}

/// What happens to in-flight fan-out work on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Wait (up to the query timeout) for running work to finish
    #[default]
    Drain,
    /// Stop awaiting running work immediately
    Cancel,
}

/// Fan-out query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Worker pool size (0 = auto-tune from the CPU count)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Global per-call timeout in milliseconds
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,

    /// How long finished query jobs are kept for retrieval
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    /// Shutdown behaviour for in-flight work
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_node_count() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_batch_entries() -> usize {
    1000
}

fn default_idle_close_secs() -> u64 {
    600
}

fn default_pool_size() -> usize {
    4
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_job_ttl_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            node_count: default_node_count(),
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_batch_entries: default_max_batch_entries(),
            compact_change_log: false,
            idle_close_secs: default_idle_close_secs(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            timeout_ms: default_query_timeout_ms(),
            job_ttl_secs: default_job_ttl_secs(),
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl MonthSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: MonthSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `data_dir` with every other value defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }

    /// Render as TOML (used by `monthsync init`)
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("cannot render configuration: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.node_count == 0 {
            return Err(crate::Error::Config("storage.node_count must be at least 1".into()));
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("storage.data_dir cannot be empty".into()));
        }

        if self.replication.poll_interval_ms == 0 {
            return Err(crate::Error::Config("replication.poll_interval_ms must be positive".into()));
        }

        if self.replication.max_batch_entries == 0 {
            return Err(crate::Error::Config("replication.max_batch_entries must be positive".into()));
        }

        if self.query.timeout_ms == 0 {
            return Err(crate::Error::Config("query.timeout_ms must be positive".into()));
        }

        Ok(())
    }

    /// Get the partition root directory
    pub fn data_dir(&self) -> &PathBuf {
        &self.storage.data_dir
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.replication.poll_interval_ms)
    }

    /// Idle time after which a caught-up partition is closed, if enabled
    pub fn idle_close(&self) -> Option<Duration> {
        (self.replication.idle_close_secs > 0).then(|| Duration::from_secs(self.replication.idle_close_secs))
    }

    /// Get the fan-out timeout as Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query.timeout_ms)
    }

    /// Get the query job TTL as Duration
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.query.job_ttl_secs)
    }

    /// Effective worker pool size, auto-tuned when configured as 0
    pub fn pool_size(&self) -> usize {
        if self.query.pool_size > 0 {
            self.query.pool_size
        } else {
            crate::tuning::auto_tune().pool_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[storage]
data_dir = "/var/lib/monthsync"
node_count = 3

[replication]
poll_interval_ms = 250
compact_change_log = true

[query]
pool_size = 8
timeout_ms = 5000
shutdown_policy = "cancel"
"#;

        let config = MonthSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.storage.node_count, 3);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.replication.max_batch_entries, 1000);
        assert!(config.replication.compact_change_log);
        assert_eq!(config.pool_size(), 8);
        assert_eq!(config.query.shutdown_policy, ShutdownPolicy::Cancel);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = MonthSyncConfig::from_str("").unwrap();
        assert_eq!(config.storage.node_count, 4);
        assert_eq!(config.query.pool_size, 4);
        assert_eq!(config.query_timeout(), Duration::from_secs(30));
        assert_eq!(config.query.shutdown_policy, ShutdownPolicy::Drain);
        assert_eq!(config.idle_close(), Some(Duration::from_secs(600)));

        let never = MonthSyncConfig::from_str("[replication]\nidle_close_secs = 0\n").unwrap();
        assert_eq!(never.idle_close(), None);
    }

    #[test]
    fn test_validation_rejects_zero_nodes() {
        let err = MonthSyncConfig::from_str("[storage]\nnode_count = 0\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_rendered_config_parses_back() {
        let config = MonthSyncConfig::with_data_dir("/tmp/parts");
        let rendered = config.to_toml().unwrap();
        let parsed = MonthSyncConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.storage.data_dir, PathBuf::from("/tmp/parts"));
    }
}
