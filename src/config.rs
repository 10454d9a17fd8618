//! Driver Configuration
//!
//! Process-wide settings passed explicitly to every component constructor.
//! Loadable from YAML; every field has a default so partial files work.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Catalog refresh period
pub const ONE_HOUR_SECS: u64 = 60 * 60;

/// Housekeeping period
pub const TEN_MINUTES_SECS: u64 = 10 * 60;

/// Copy job status poll interval
pub const DEFAULT_COPY_POLL_INTERVAL_SECS: u64 = 10;

/// Default overall migration/copy timeout
pub const DEFAULT_MIGRATE_TIMEOUT_SECS: u64 = 3600;

/// How long finished copy jobs stay in the ledger
pub const DEFAULT_LEDGER_RETENTION_SECS: u64 = 3600;

// =============================================================================
// Section Configs
// =============================================================================

/// Periodic task scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Catalog refresh interval in seconds
    pub catalog_refresh_secs: u64,
    /// Housekeeping interval in seconds
    pub housekeeping_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            catalog_refresh_secs: ONE_HOUR_SECS,
            housekeeping_secs: TEN_MINUTES_SECS,
        }
    }
}

/// Remote copy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Status poll interval in seconds
    pub poll_interval_secs: u64,
    /// Overall timeout in seconds (netapp_migrate_volume_timeout)
    pub migrate_timeout_secs: u64,
    /// Finished jobs are pruned from the ledger after this many seconds
    pub ledger_retention_secs: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_COPY_POLL_INTERVAL_SECS,
            migrate_timeout_secs: DEFAULT_MIGRATE_TIMEOUT_SECS,
            ledger_retention_secs: DEFAULT_LEDGER_RETENTION_SECS,
        }
    }
}

impl CopyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.migrate_timeout_secs)
    }

    pub fn ledger_retention(&self) -> Duration {
        Duration::from_secs(self.ledger_retention_secs)
    }
}

/// Group snapshot teardown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Seconds between busy checks
    pub busy_poll_interval_secs: u64,
    /// Busy checks before giving up and deferring deletion
    pub busy_poll_attempts: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            busy_poll_interval_secs: 1,
            busy_poll_attempts: 10,
        }
    }
}

impl SnapshotConfig {
    pub fn busy_poll_interval(&self) -> Duration {
        Duration::from_secs(self.busy_poll_interval_secs)
    }
}

/// Performance sampler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Samples older than this are treated as missing
    pub stale_after_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 2 * TEN_MINUTES_SECS,
        }
    }
}

// =============================================================================
// Driver Config
// =============================================================================

/// Top-level configuration for one backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Configured backend stanza name
    pub backend_name: String,
    /// Reported volume_backend_name, defaults to the driver name
    pub volume_backend_name: Option<String>,
    /// SVM serving the shares
    pub vserver: String,
    /// Active backend after a failover, if any
    pub failed_over_backend_name: Option<String>,
    /// Report provisioned capacity by listing volume files
    pub reports_provisioned_capacity: bool,
    /// Controller supports file clones inside FlexGroups
    ///
    /// When false, FlexGroup pools are deleted through the share mount only.
    pub flexgroup_clone_file_supported: bool,
    /// Controller supports FlexGroup pools at all
    pub flexgroup_supported: bool,
    pub schedule: ScheduleConfig,
    pub copy: CopyConfig,
    pub snapshot: SnapshotConfig,
    pub performance: PerformanceConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend_name: "ontap-nfs".to_string(),
            volume_backend_name: None,
            vserver: "svm0".to_string(),
            failed_over_backend_name: None,
            reports_provisioned_capacity: false,
            flexgroup_clone_file_supported: true,
            flexgroup_supported: true,
            schedule: ScheduleConfig::default(),
            copy: CopyConfig::default(),
            snapshot: SnapshotConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Parse a YAML document and validate it
    pub fn from_yaml_str(doc: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let doc = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&doc)
    }

    /// Reject settings that would make the polling loops meaningless
    pub fn validate(&self) -> Result<()> {
        if self.backend_name.trim().is_empty() {
            return Err(Error::Configuration("backend_name must not be empty".into()));
        }
        if self.vserver.trim().is_empty() {
            return Err(Error::Configuration("vserver must not be empty".into()));
        }
        if self.copy.poll_interval_secs == 0 {
            return Err(Error::Configuration(
                "copy.poll_interval_secs must be greater than zero".into(),
            ));
        }
        if self.copy.migrate_timeout_secs < self.copy.poll_interval_secs {
            return Err(Error::Configuration(format!(
                "copy.migrate_timeout_secs ({}) is shorter than the poll interval ({})",
                self.copy.migrate_timeout_secs, self.copy.poll_interval_secs
            )));
        }
        if self.schedule.catalog_refresh_secs == 0 || self.schedule.housekeeping_secs == 0 {
            return Err(Error::Configuration(
                "schedule intervals must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Backend whose client is currently active
    pub fn active_backend(&self) -> &str {
        self.failed_over_backend_name
            .as_deref()
            .unwrap_or(&self.backend_name)
    }

    pub fn failed_over(&self) -> bool {
        self.failed_over_backend_name.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DriverConfig::default();
        config.validate().unwrap();
        assert_eq!(config.schedule.catalog_refresh_secs, 3600);
        assert_eq!(config.schedule.housekeeping_secs, 600);
        assert_eq!(config.copy.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.copy.ledger_retention(), Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = DriverConfig::from_yaml_str(
            "backend_name: cluster1\nvserver: svm-nfs\ncopy:\n  migrate_timeout_secs: 120\n",
        )
        .unwrap();
        assert_eq!(config.backend_name, "cluster1");
        assert_eq!(config.copy.migrate_timeout_secs, 120);
        assert_eq!(config.copy.poll_interval_secs, 10);
        assert_eq!(config.active_backend(), "cluster1");
        assert!(!config.failed_over());
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let result = DriverConfig::from_yaml_str("copy:\n  poll_interval_secs: 0\n");
        assert_matches!(result, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend_name: b1").unwrap();
        writeln!(file, "failed_over_backend_name: b2").unwrap();
        writeln!(file, "reports_provisioned_capacity: true").unwrap();

        let config = DriverConfig::from_yaml_file(file.path()).unwrap();
        assert!(config.reports_provisioned_capacity);
        assert_eq!(config.active_backend(), "b2");
        assert!(config.failed_over());
    }
}
