//! Configuration management for the reconfiguration agent
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (FAILOVER_* prefix, highest precedence)
//! 2. failover.local.toml (gitignored, local overrides)
//! 3. failover.toml (project config)
//! 4. ~/.config/failover/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The agent never reads configuration itself: a loaded [`RaConfig`] is
//! injected when the agent is constructed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{LOCAL_FILE, Layer, PROJECT_FILE, Paths};

/// Main reconfiguration agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaConfig {
    pub retry: RetryConfig,
    pub timing: TimingConfig,
    pub reconfiguration: ReconfigurationConfig,
    pub runtime: RuntimeConfig,
}

/// Warning and drop thresholds for one retryable operation kind.
///
/// A `drop` of zero means the operation is retried forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryThresholds {
    pub warning: u32,
    pub drop: u32,
}

impl RetryThresholds {
    pub const fn new(warning: u32, drop: u32) -> Self {
        Self { warning, drop }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub replica_open: RetryThresholds,
    pub replica_reopen: RetryThresholds,
    pub replica_close: RetryThresholds,
    pub registration_at_open: RetryThresholds,
    pub registration_at_reopen: RetryThresholds,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            replica_open: RetryThresholds::new(10, 40),
            replica_reopen: RetryThresholds::new(10, 40_320),
            replica_close: RetryThresholds::new(10, 40_320),
            registration_at_open: RetryThresholds::new(240, 1_920),
            registration_at_reopen: RetryThresholds::new(240, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub message_retry_interval_ms: u64,
    pub replica_up_batch_interval_ms: u64,
    pub remote_replica_progress_query_wait_ms: u64,
    pub reconfiguration_health_report_threshold_ms: u64,
    pub upgrade_check_interval_ms: u64,
    pub upgrade_max_replica_close_duration_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            message_retry_interval_ms: 5_000,
            replica_up_batch_interval_ms: 1_000,
            remote_replica_progress_query_wait_ms: 30_000,
            reconfiguration_health_report_threshold_ms: 300_000,
            upgrade_check_interval_ms: 10_000,
            upgrade_max_replica_close_duration_ms: 900_000,
        }
    }
}

impl TimingConfig {
    pub fn message_retry_interval(&self) -> Duration {
        Duration::from_millis(self.message_retry_interval_ms)
    }

    pub fn replica_up_batch_interval(&self) -> Duration {
        Duration::from_millis(self.replica_up_batch_interval_ms)
    }

    pub fn remote_replica_progress_query_wait(&self) -> Duration {
        Duration::from_millis(self.remote_replica_progress_query_wait_ms)
    }

    pub fn reconfiguration_health_report_threshold(&self) -> Duration {
        Duration::from_millis(self.reconfiguration_health_report_threshold_ms)
    }

    pub fn upgrade_check_interval(&self) -> Duration {
        Duration::from_millis(self.upgrade_check_interval_ms)
    }

    pub fn upgrade_max_replica_close_duration(&self) -> Duration {
        Duration::from_millis(self.upgrade_max_replica_close_duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconfigurationConfig {
    /// Skip the deactivate phase when no replica changes membership.
    pub enable_phase3_phase4_in_parallel: bool,
    pub is_deactivation_info_enabled: bool,
}

impl Default for ReconfigurationConfig {
    fn default() -> Self {
        Self {
            enable_phase3_phase4_in_parallel: true,
            is_deactivation_info_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the bounded event inbox.
    pub inbox_capacity: usize,
    /// Upper bound on job items executed per drain.
    pub max_jobs_per_drain: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 4_096,
            max_jobs_per_drain: 1_024,
        }
    }
}

impl RaConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file without merging other sources.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RaConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with short intervals, for tests and local clusters.
    pub fn development() -> Self {
        Self {
            timing: TimingConfig {
                message_retry_interval_ms: 100,
                replica_up_batch_interval_ms: 50,
                remote_replica_progress_query_wait_ms: 1_000,
                reconfiguration_health_report_threshold_ms: 10_000,
                upgrade_check_interval_ms: 100,
                upgrade_max_replica_close_duration_ms: 5_000,
            },
            ..Default::default()
        }
    }

    /// Rejects configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("replica_open", self.retry.replica_open),
            ("replica_reopen", self.retry.replica_reopen),
            ("replica_close", self.retry.replica_close),
            ("registration_at_open", self.retry.registration_at_open),
            ("registration_at_reopen", self.retry.registration_at_reopen),
        ];
        for (name, t) in thresholds {
            if t.drop != 0 && t.warning > t.drop {
                return Err(ConfigError::invalid(
                    format!("retry.{name}"),
                    format!("warning threshold {} exceeds drop threshold {}", t.warning, t.drop),
                ));
            }
        }

        let intervals = [
            ("message_retry_interval_ms", self.timing.message_retry_interval_ms),
            ("replica_up_batch_interval_ms", self.timing.replica_up_batch_interval_ms),
            ("upgrade_check_interval_ms", self.timing.upgrade_check_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::invalid(format!("timing.{name}"), "must be non-zero"));
            }
        }

        if self.runtime.inbox_capacity == 0 || self.runtime.max_jobs_per_drain == 0 {
            return Err(ConfigError::invalid("runtime", "capacities must be non-zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = RaConfig::default();
        assert_eq!(config.retry.replica_open, RetryThresholds::new(10, 40));
        assert_eq!(config.retry.registration_at_reopen.drop, 0);
        assert_eq!(config.timing.remote_replica_progress_query_wait(), Duration::from_secs(30));
        assert!(config.reconfiguration.enable_phase3_phase4_in_parallel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = RaConfig::development();
        assert_eq!(config.timing.message_retry_interval(), Duration::from_millis(100));
        assert_eq!(config.retry, RetryConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        let mut config = RaConfig::default();
        config.retry.replica_open = RetryThresholds::new(50, 40);
        let err = config.validate().expect_err("inverted thresholds must fail");
        assert!(err.to_string().contains("replica_open"));
    }

    #[test]
    fn test_validation_allows_unbounded_drop() {
        let mut config = RaConfig::default();
        config.retry.replica_close = RetryThresholds::new(500, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut config = RaConfig::default();
        config.timing.message_retry_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_from_toml_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("ra.toml");
        fs::write(
            &path,
            r#"
[timing]
message_retry_interval_ms = 250

[reconfiguration]
enable_phase3_phase4_in_parallel = false
"#,
        )
        .expect("Failed to write config");

        let config = RaConfig::from_toml_file(&path).expect("Failed to parse config");
        assert_eq!(config.timing.message_retry_interval_ms, 250);
        assert!(!config.reconfiguration.enable_phase3_phase4_in_parallel);
        assert_eq!(config.timing.upgrade_check_interval_ms, 10_000);
    }

    #[test]
    fn test_from_toml_file_reports_parse_errors() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "[timing\nmessage_retry_interval_ms = ").expect("Failed to write config");

        assert!(matches!(
            RaConfig::from_toml_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_from_toml_file_missing() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        assert!(matches!(
            RaConfig::from_toml_file(temp_dir.path().join("absent.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
