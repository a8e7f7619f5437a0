//! Backup Vault
//!
//! On-demand snapshots of automation configurations, kept independently of
//! the version ledger. Coordinators take a backup before every mutating step
//! so a failed or regretted change can always be recovered.
//!
//! Restoring a backup never rewrites history: it pushes the snapshot to the
//! runtime and appends a *new* version with no parent.

mod vault;

pub use vault::{BackupSnapshot, BackupVault, RestoreOutcome, STORAGE_KEY};
