//! YAML configuration for the automation lifecycle core
//!
//! Configuration lives under the `automation_lifecycle:` key of a YAML file.
//! Every key has a default, so an empty or missing section yields a working
//! configuration. Scalar values may use the `!env_var VAR` tag to read from
//! the environment.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::LifecycleConfig;
//!
//! let config = LifecycleConfig::load("/config/configuration.yaml")?;
//! let ttl = config.sessions.ttl();
//! ```

mod error;
mod lifecycle_config;
mod loader;

pub use error::{ConfigError, ConfigResult};
pub use lifecycle_config::{
    ApplyConfig, CleanupConfig, DependencyConfig, HistoryConfig, LifecycleConfig,
    RetentionConfig, RetirementConfig, SessionConfig, StorageConfig, CONFIG_SECTION,
};
pub use loader::{load_yaml, load_yaml_string};

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
