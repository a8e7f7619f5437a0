//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid YAML: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The `automation_lifecycle:` section does not match the expected shape
    #[error("malformed automation_lifecycle section: {source}")]
    Section {
        #[source]
        source: serde_yaml::Error,
    },

    /// `!env_var` names a variable that is not set
    #[error("!env_var {var} is not set")]
    MissingEnvVar { var: String },

    #[error("tag {tag} is not supported, only !env_var")]
    UnsupportedTag { tag: String },

    /// A value parsed but would disable a safety guarantee
    #[error("{key}: {reason}")]
    Invalid { key: String, reason: String },
}
