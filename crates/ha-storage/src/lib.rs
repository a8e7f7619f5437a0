//! Snapshot persistence for lifecycle ledgers
//!
//! Ledgers are written as versioned JSON envelopes under
//! `<config_dir>/.storage/`:
//!
//! ```json
//! {
//!   "version": 1,
//!   "minor_version": 1,
//!   "key": "automation_lifecycle.versions",
//!   "data": { ... }
//! }
//! ```
//!
//! Writes go to a sibling `.tmp` file that is renamed into place, so a crash
//! never leaves a half-written ledger behind.

use std::io;
use std::path::{Path, PathBuf};

use ha_core::LifecycleError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger {key} is not valid JSON: {source}")]
    Json {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger {key} has schema v{found}, this build reads v{expected}")]
    SchemaMismatch {
        key: &'static str,
        expected: u32,
        found: u32,
    },
}

impl From<StorageError> for LifecycleError {
    fn from(err: StorageError) -> Self {
        LifecycleError::Storage(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A ledger persisted under a fixed key
///
/// Bump `VERSION` for breaking layout changes and `MINOR_VERSION` for
/// additive ones (new fields with serde defaults).
pub trait Storable: Serialize + DeserializeOwned {
    const KEY: &'static str;
    const VERSION: u32;
    const MINOR_VERSION: u32;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    minor_version: u32,
    key: &'static str,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    #[serde(default)]
    minor_version: u32,
    data: T,
}

/// Reject snapshots written by an incompatible major version
fn check_schema<T: Storable>(version: u32, minor_version: u32) -> StorageResult<()> {
    if version != T::VERSION {
        return Err(StorageError::SchemaMismatch {
            key: T::KEY,
            expected: T::VERSION,
            found: version,
        });
    }
    if minor_version < T::MINOR_VERSION {
        warn!(
            key = T::KEY,
            found = minor_version,
            current = T::MINOR_VERSION,
            "Loading ledger written by an older minor version"
        );
    }
    Ok(())
}

/// Handle to the `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Storage rooted at `<config_dir>/.storage`
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            root: config_dir.as_ref().join(".storage"),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Load a ledger, `None` when it was never saved
    pub async fn load<T: Storable>(&self) -> StorageResult<Option<T>> {
        let path = self.path_for(T::KEY);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                debug!(key = T::KEY, "No saved ledger");
                return Ok(None);
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        let envelope: Envelope<T> = serde_json::from_slice(&bytes)
            .map_err(|source| StorageError::Json { key: T::KEY, source })?;
        check_schema::<T>(envelope.version, envelope.minor_version)?;

        debug!(key = T::KEY, bytes = bytes.len(), "Loaded ledger");
        Ok(Some(envelope.data))
    }

    /// Write a ledger, replacing any previous snapshot atomically
    pub async fn save<T: Storable>(&self, data: &T) -> StorageResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                path: self.root.clone(),
                source,
            })?;

        let body = serde_json::to_vec_pretty(&EnvelopeRef {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY,
            data,
        })
        .map_err(|source| StorageError::Json { key: T::KEY, source })?;

        let target = self.path_for(T::KEY);
        let staging = self.path_for(&format!("{}.tmp", T::KEY));
        fs::write(&staging, &body)
            .await
            .map_err(|source| StorageError::Io {
                path: staging.clone(),
                source,
            })?;
        fs::rename(&staging, &target)
            .await
            .map_err(|source| StorageError::Io {
                path: target.clone(),
                source,
            })?;

        debug!(key = T::KEY, bytes = body.len(), "Saved ledger");
        Ok(())
    }
}
