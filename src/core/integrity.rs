//! Content hashing and integrity checks.
//!
//! Hashes are SHA-256, lowercase hex. A mismatch between the bytes on disk and
//! the recorded hash is always a hard failure; nothing here repairs content.

use crate::core::error::PmsError;
use crate::core::index::{ContentKind, IndexEntry, IndexFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// When `load` recomputes and compares hashes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityPolicy {
    /// Only scopes declared with `integrity_checked = true`.
    #[default]
    PerScope,
    Always,
    Never,
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Result of a non-raising integrity check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub scope: String,
    pub ok: bool,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy)]
pub struct IntegrityValidator {
    policy: IntegrityPolicy,
}

impl IntegrityValidator {
    /// `sha_validation_enabled = false` in the index overrides any configured policy.
    pub fn new(policy: IntegrityPolicy, flags: &IndexFlags) -> Self {
        let policy = if flags.sha_validation_enabled {
            policy
        } else {
            IntegrityPolicy::Never
        };
        Self { policy }
    }

    pub fn policy(&self) -> IntegrityPolicy {
        self.policy
    }

    pub fn should_check(&self, entry: &IndexEntry) -> bool {
        match self.policy {
            IntegrityPolicy::PerScope => entry.integrity_checked,
            IntegrityPolicy::Always => true,
            IntegrityPolicy::Never => false,
        }
    }

    /// Compare `bytes` against `expected`, returning the actual hash on success.
    pub fn check(&self, scope: &str, bytes: &[u8], expected: &str) -> Result<String, PmsError> {
        let actual = content_hash(bytes);
        if actual != expected {
            return Err(PmsError::Integrity {
                scope: scope.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(actual)
    }

    /// Structural rules declared on the index entry. Returns the list of missing markers.
    pub fn validate_structure(&self, entry: &IndexEntry, bytes: &[u8]) -> Result<(), String> {
        if entry.required_sections.is_empty() {
            return Ok(());
        }
        let missing = missing_sections(entry.kind, &entry.required_sections, bytes)?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required sections: {}", missing.join(", ")))
        }
    }
}

fn missing_sections(
    kind: ContentKind,
    required: &[String],
    bytes: &[u8],
) -> Result<Vec<String>, String> {
    match kind {
        ContentKind::Tabular => {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .from_reader(bytes);
            let headers = reader
                .headers()
                .map_err(|e| format!("unreadable header row: {}", e))?;
            let present: Vec<&str> = headers.iter().map(str::trim).collect();
            Ok(required
                .iter()
                .filter(|col| !present.contains(&col.as_str()))
                .cloned()
                .collect())
        }
        ContentKind::Structured => {
            let text = std::str::from_utf8(bytes).map_err(|_| "content is not UTF-8".to_string())?;
            Ok(required
                .iter()
                .filter(|key| !text.lines().any(|line| declares_key(line, key)))
                .cloned()
                .collect())
        }
        ContentKind::Text => {
            let text = std::str::from_utf8(bytes).map_err(|_| "content is not UTF-8".to_string())?;
            Ok(required
                .iter()
                .filter(|marker| !text.contains(marker.as_str()))
                .cloned()
                .collect())
        }
    }
}

fn declares_key(line: &str, key: &str) -> bool {
    let Some(rest) = line.trim_start().strip_prefix(key) else {
        return false;
    };
    let rest = rest.trim_start();
    rest.starts_with(':') || rest.starts_with('=')
}
