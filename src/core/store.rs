//! On-disk layout of a PMS project.
//!
//! A project root holds the user-visible documents (wherever the index points)
//! and a private `.pms/` state directory for staging, metadata, backups, locks
//! and the audit log.

use crate::core::error::PmsError;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the private state directory under the project root.
pub const STATE_DIR: &str = ".pms";

/// Handle to a project's storage layout.
///
/// Cheap to clone; holds paths only, never open files.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the project root
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join("config.toml")
    }

    /// Staging area for in-flight transactions. Same filesystem as the targets
    /// so the commit rename stays atomic.
    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.state_dir().join("meta")
    }

    pub fn meta_path(&self, scope: &str) -> PathBuf {
        self.meta_dir().join(format!("{}.json", scope))
    }

    pub fn backups_dir(&self, scope: &str) -> PathBuf {
        self.state_dir().join("backups").join(scope)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn lock_path(&self, scope: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", scope))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_dir().join("audit.events.jsonl")
    }

    /// Resolve a location declared in the index against the project root.
    pub fn resolve(&self, location: &Path) -> PathBuf {
        self.root.join(location)
    }

    /// Create every private directory the store writes into.
    pub fn ensure_layout(&self) -> Result<(), PmsError> {
        for dir in [
            self.state_dir(),
            self.staging_dir(),
            self.meta_dir(),
            self.locks_dir(),
            self.state_dir().join("backups"),
        ] {
            fs::create_dir_all(&dir).map_err(PmsError::IoError)?;
        }
        Ok(())
    }
}
