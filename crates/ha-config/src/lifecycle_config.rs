//! Lifecycle configuration
//!
//! Parses the `automation_lifecycle:` section.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::{load_yaml, load_yaml_string};

/// Top-level key of the lifecycle section
pub const CONFIG_SECTION: &str = "automation_lifecycle";

/// Upper bound for every lifetime, interval and budget (100 years)
pub const MAX_DURATION_SECONDS: u64 = 100 * 365 * 86_400;

/// Upper bound for the retention ages
pub const MAX_AGE_DAYS: u32 = 100 * 365;

/// Seconds as a chrono duration, saturating instead of overflowing
fn seconds(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or_else(chrono::Duration::max_value)
}

fn days(value: u32) -> chrono::Duration {
    chrono::Duration::try_days(i64::from(value)).unwrap_or_else(chrono::Duration::max_value)
}

/// Retention policies for versions and backups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Maximum versions kept per automation (the latest is always kept)
    pub max_versions_per_automation: usize,
    /// Versions older than this are pruned (latest always kept)
    pub max_version_age_days: Option<u32>,
    /// Maximum backups kept per automation
    pub max_backups_per_automation: usize,
    /// Backups older than this are pruned
    pub max_backup_age_days: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_versions_per_automation: 50,
            max_version_age_days: None,
            max_backups_per_automation: 20,
            max_backup_age_days: None,
        }
    }
}

impl RetentionConfig {
    pub fn max_version_age(&self) -> Option<chrono::Duration> {
        self.max_version_age_days.map(days)
    }

    pub fn max_backup_age(&self) -> Option<chrono::Duration> {
        self.max_backup_age_days.map(days)
    }
}

/// Modification session lifetimes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time a session may stay non-terminal before it expires
    pub ttl_seconds: u64,
    /// Time terminal sessions are kept for status queries
    pub terminal_retention_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 900,
            terminal_retention_seconds: 86_400,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        seconds(self.ttl_seconds)
    }

    pub fn terminal_retention(&self) -> chrono::Duration {
        seconds(self.terminal_retention_seconds)
    }
}

/// Retirement request lifetimes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetirementConfig {
    /// Open (initiated or blocked) requests older than this are removed
    pub request_ttl_seconds: u64,
}

impl Default for RetirementConfig {
    fn default() -> Self {
        Self {
            request_ttl_seconds: 86_400,
        }
    }
}

impl RetirementConfig {
    pub fn request_ttl(&self) -> chrono::Duration {
        seconds(self.request_ttl_seconds)
    }
}

/// Dependency traversal budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    pub max_traversal_depth: usize,
    pub traversal_budget_ms: u64,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            max_traversal_depth: 16,
            traversal_budget_ms: 250,
        }
    }
}

impl DependencyConfig {
    pub fn traversal_budget(&self) -> Duration {
        Duration::from_millis(self.traversal_budget_ms)
    }
}

/// Apply pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Budget for one call into the authoring service
    pub authoring_timeout_ms: u64,
    /// Internal retries on sequence conflicts before surfacing them
    pub sequence_conflict_retries: u32,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            authoring_timeout_ms: 5_000,
            sequence_conflict_retries: 3,
        }
    }
}

impl ApplyConfig {
    pub fn authoring_timeout(&self) -> Duration {
        Duration::from_millis(self.authoring_timeout_ms)
    }
}

/// History paging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_page_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_page_size: 100 }
    }
}

/// Periodic cleanup schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_seconds: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Snapshot persistence location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Config directory; snapshots go to `<config_dir>/.storage/`
    pub config_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("."),
        }
    }
}

/// Complete lifecycle configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub retention: RetentionConfig,
    pub sessions: SessionConfig,
    pub retirement: RetirementConfig,
    pub dependencies: DependencyConfig,
    pub apply: ApplyConfig,
    pub history: HistoryConfig,
    pub cleanup: CleanupConfig,
    pub storage: StorageConfig,
}

impl LifecycleConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config = Self::from_yaml(&load_yaml(path.as_ref())?)?;
        info!(
            "Loaded automation lifecycle configuration from {:?}",
            path.as_ref()
        );
        Ok(config)
    }

    /// Parse from a YAML string
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        Self::from_yaml(&load_yaml_string(content)?)
    }

    /// Extract the lifecycle section from a parsed document
    ///
    /// Accepts either a document with an `automation_lifecycle:` key or the
    /// bare section itself. A null document yields the defaults.
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        let section = yaml.get(CONFIG_SECTION).unwrap_or(yaml);
        let config: LifecycleConfig = if section.is_null() {
            LifecycleConfig::default()
        } else {
            serde_yaml::from_value(section.clone())
                .map_err(|source| ConfigError::Section { source })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a safety guarantee
    pub fn validate(&self) -> ConfigResult<()> {
        if self.retention.max_versions_per_automation == 0 {
            return Err(invalid(
                "retention.max_versions_per_automation",
                "must keep at least one version",
            ));
        }
        if self.dependencies.max_traversal_depth == 0 {
            return Err(invalid(
                "dependencies.max_traversal_depth",
                "must be at least 1",
            ));
        }
        if self.dependencies.traversal_budget_ms == 0 {
            return Err(invalid("dependencies.traversal_budget_ms", "must be positive"));
        }
        if self.apply.authoring_timeout_ms == 0 {
            return Err(invalid("apply.authoring_timeout_ms", "must be positive"));
        }
        if self.history.max_page_size == 0 {
            return Err(invalid("history.max_page_size", "must be positive"));
        }
        if self.sessions.ttl_seconds == 0 {
            return Err(invalid("sessions.ttl_seconds", "must be positive"));
        }
        if self.cleanup.interval_seconds == 0 {
            return Err(invalid("cleanup.interval_seconds", "must be positive"));
        }

        let max_ms = MAX_DURATION_SECONDS * 1_000;
        at_most("sessions.ttl_seconds", self.sessions.ttl_seconds, MAX_DURATION_SECONDS)?;
        at_most(
            "sessions.terminal_retention_seconds",
            self.sessions.terminal_retention_seconds,
            MAX_DURATION_SECONDS,
        )?;
        at_most(
            "retirement.request_ttl_seconds",
            self.retirement.request_ttl_seconds,
            MAX_DURATION_SECONDS,
        )?;
        at_most(
            "cleanup.interval_seconds",
            self.cleanup.interval_seconds,
            MAX_DURATION_SECONDS,
        )?;
        at_most(
            "dependencies.traversal_budget_ms",
            self.dependencies.traversal_budget_ms,
            max_ms,
        )?;
        at_most("apply.authoring_timeout_ms", self.apply.authoring_timeout_ms, max_ms)?;
        for (key, value) in [
            ("retention.max_version_age_days", self.retention.max_version_age_days),
            ("retention.max_backup_age_days", self.retention.max_backup_age_days),
        ] {
            if let Some(days) = value {
                at_most(key, u64::from(days), u64::from(MAX_AGE_DAYS))?;
            }
        }
        Ok(())
    }
}

fn at_most(key: &str, value: u64, max: u64) -> ConfigResult<()> {
    if value > max {
        return Err(invalid(key, &format!("must be at most {}", max)));
    }
    Ok(())
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
