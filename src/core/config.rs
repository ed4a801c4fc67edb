//! Project configuration loaded from `.pms/config.toml`.
//!
//! Every field has a default, and a missing file is not an error: a freshly
//! scaffolded project runs on defaults until an operator overrides them.

use crate::core::error::PmsError;
use crate::core::integrity::IntegrityPolicy;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PmsConfig {
    /// Index resource, relative to the project root.
    pub index_path: PathBuf,
    /// Directory of `<agent_id>.toml` profiles, relative to the project root.
    pub agents_dir: PathBuf,
    pub lock_timeout_ms: u64,
    pub audit_timeout_ms: u64,
    /// Number of prior versions kept per scope for rollback.
    pub backup_retention: usize,
    pub integrity_policy: IntegrityPolicy,
    pub ledger: LedgerConfig,
}

/// Where the change-proposal table lives and who may merge into the protected document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub scope: String,
    pub protected_scope: String,
    pub owner: String,
}

impl Default for PmsConfig {
    fn default() -> Self {
        Self {
            index_path: PathBuf::from("memory/index.toml"),
            agents_dir: PathBuf::from("agents"),
            lock_timeout_ms: 30_000,
            audit_timeout_ms: 250,
            backup_retention: 10,
            integrity_policy: IntegrityPolicy::PerScope,
            ledger: LedgerConfig::default(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            scope: "blueprint_changes".to_string(),
            protected_scope: "blueprint".to_string(),
            owner: "blueprint_agent".to_string(),
        }
    }
}

impl PmsConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_millis(self.audit_timeout_ms)
    }

    pub fn to_toml_string(&self) -> Result<String, PmsError> {
        toml::to_string_pretty(self).map_err(|e| PmsError::ConfigError(e.to_string()))
    }
}

/// Load `.pms/config.toml`, falling back to defaults when absent.
pub fn load_config(store: &Store) -> Result<PmsConfig, PmsError> {
    let path = store.config_path();
    if !path.exists() {
        return Ok(PmsConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(PmsError::IoError)?;
    let config: PmsConfig = toml::from_str(&content)?;
    if config.backup_retention == 0 {
        return Err(PmsError::ConfigError(
            "backup_retention must be at least 1".to_string(),
        ));
    }
    Ok(config)
}
