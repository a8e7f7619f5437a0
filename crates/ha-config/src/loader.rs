//! YAML loading with `!env_var` substitution

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, trace};

use crate::error::{ConfigError, ConfigResult};

/// Load a YAML file and resolve `!env_var` tags
pub fn load_yaml(path: impl AsRef<Path>) -> ConfigResult<Value> {
    let path = path.as_ref();
    debug!("Loading YAML file: {:?}", path);

    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse(&content, path.to_path_buf())
}

/// Load YAML from a string and resolve `!env_var` tags
pub fn load_yaml_string(content: &str) -> ConfigResult<Value> {
    parse(content, PathBuf::from("<string>"))
}

fn parse(content: &str, source_path: PathBuf) -> ConfigResult<Value> {
    let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::Yaml {
        path: source_path,
        source: e,
    })?;
    resolve(value)
}

fn resolve(value: Value) -> ConfigResult<Value> {
    match value {
        Value::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            if tag != "!env_var" {
                return Err(ConfigError::UnsupportedTag { tag });
            }
            let var = match tagged.value {
                Value::String(var) => var,
                other => {
                    return Err(ConfigError::Invalid {
                        key: "!env_var".to_string(),
                        reason: format!("expected variable name, got {:?}", other),
                    })
                }
            };
            let raw = std::env::var(&var).map_err(|_| ConfigError::MissingEnvVar {
                var: var.clone(),
            })?;
            trace!("Resolved !env_var {}", var);
            // Parse as a YAML scalar so numbers and booleans keep their type
            Ok(serde_yaml::from_str(&raw).unwrap_or(Value::String(raw)))
        }
        Value::Mapping(map) => {
            let mut resolved = serde_yaml::Mapping::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k, resolve(v)?);
            }
            Ok(Value::Mapping(resolved))
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.into_iter().map(resolve).collect::<ConfigResult<_>>()?,
        )),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution_keeps_scalar_type() {
        std::env::set_var("HA_LIFECYCLE_TEST_RETRIES", "7");
        let value = load_yaml_string("retries: !env_var HA_LIFECYCLE_TEST_RETRIES").unwrap();
        assert_eq!(value["retries"].as_u64(), Some(7));
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let result = load_yaml_string("x: !env_var HA_LIFECYCLE_TEST_DEFINITELY_UNSET");
        assert!(matches!(result, Err(ConfigError::MissingEnvVar { .. })));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let result = load_yaml_string("x: !secret api_key");
        assert!(matches!(result, Err(ConfigError::UnsupportedTag { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = load_yaml("/nonexistent/configuration.yaml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
