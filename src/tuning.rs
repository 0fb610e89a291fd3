//! Auto-tuning module
//!
//! Sizes the fan-out worker pool from the detected hardware when the
//! configuration leaves `query.pool_size` at 0.

use sysinfo::System;

/// Tuned configuration values based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Fan-out worker pool size
    pub pool_size: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            detected_cores: 4,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.cpus().len().max(1)
}

/// Auto-tune configuration based on detected hardware
///
/// Node queries are blocking SQLite calls, so the pool follows the core
/// count, bounded to [2, 16].
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let config = TunedConfig {
        pool_size: cores.clamp(2, 16),
        detected_cores: cores,
    };

    tracing::info!(
        cores = cores,
        pool_size = config.pool_size,
        "Auto-tuned query pool based on hardware"
    );

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tune_returns_sensible_values() {
        let config = auto_tune();
        assert!(config.pool_size >= 2);
        assert!(config.pool_size <= 16);
        assert!(config.detected_cores >= 1);
    }
}
