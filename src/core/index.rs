//! Index resolver: logical scope name -> physical resource.
//!
//! The index is read once when a store opens. Scopes are declared, never
//! discovered: resolving an undeclared name is `ScopeNotFound`. The only field
//! that changes during a process lifetime is the expected hash, which the
//! document store records after each commit.

use crate::core::error::PmsError;
use crate::core::transaction::write_file_atomic;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Free text (markdown and the like).
    #[default]
    Text,
    /// Key-value documents (YAML/TOML style).
    Structured,
    /// Tabular logs with a header row (CSV).
    Tabular,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    /// Filled from the table key on load.
    #[serde(skip)]
    pub scope: String,
    /// Location relative to the project root.
    pub path: PathBuf,
    #[serde(default)]
    pub kind: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    #[serde(default)]
    pub integrity_checked: bool,
    /// Protected documents always take the dual-write path.
    #[serde(default)]
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_sections: Vec<String>,
}

impl IndexEntry {
    pub fn new(path: impl Into<PathBuf>, kind: ContentKind) -> Self {
        Self {
            scope: String::new(),
            path: path.into(),
            kind,
            expected_hash: None,
            integrity_checked: false,
            protected: false,
            required_sections: Vec::new(),
        }
    }

    pub fn integrity_checked(mut self) -> Self {
        self.integrity_checked = true;
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn with_required_sections(mut self, sections: &[&str]) -> Self {
        self.required_sections = sections.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Whether writes must go through the full stage/validate/commit protocol.
    pub fn requires_dual(&self) -> bool {
        self.integrity_checked || self.protected
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexFlags {
    pub dual_rollback_enabled: bool,
    pub sha_validation_enabled: bool,
}

impl Default for IndexFlags {
    fn default() -> Self {
        Self {
            dual_rollback_enabled: true,
            sha_validation_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    flags: IndexFlags,
    #[serde(default)]
    scopes: BTreeMap<String, IndexEntry>,
}

pub fn validate_scope_name(scope: &str) -> Result<(), PmsError> {
    static SCOPE_NAME: OnceLock<Regex> = OnceLock::new();
    let re = SCOPE_NAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("scope name pattern is valid")
    });
    if re.is_match(scope) {
        Ok(())
    } else {
        Err(PmsError::ValidationError(format!(
            "invalid scope name '{}': use letters, digits, '_', '-', '.'",
            scope
        )))
    }
}

fn validate_location(scope: &str, path: &Path) -> Result<(), PmsError> {
    let escapes = path.is_absolute()
        || path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
    if escapes || path.as_os_str().is_empty() {
        return Err(PmsError::ConfigError(format!(
            "scope '{}' location '{}' must be a relative path inside the project root",
            scope,
            path.display()
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct ScopeIndex {
    path: PathBuf,
    flags: IndexFlags,
    entries: BTreeMap<String, Arc<IndexEntry>>,
    recorded_hashes: RwLock<HashMap<String, String>>,
}

impl ScopeIndex {
    /// An empty index that will persist to `path` on `declare`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flags: IndexFlags::default(),
            entries: BTreeMap::new(),
            recorded_hashes: RwLock::new(HashMap::new()),
        }
    }

    /// Read the index resource. A missing file yields an empty index.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PmsError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::empty(path));
        }
        let content = fs::read_to_string(&path).map_err(PmsError::IoError)?;
        let file: IndexFile = toml::from_str(&content)?;
        let mut entries = BTreeMap::new();
        for (scope, mut entry) in file.scopes {
            validate_scope_name(&scope)?;
            validate_location(&scope, &entry.path)?;
            entry.scope = scope.clone();
            entries.insert(scope, Arc::new(entry));
        }
        Ok(Self {
            path,
            flags: file.flags,
            entries,
            recorded_hashes: RwLock::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> IndexFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: IndexFlags) -> Result<(), PmsError> {
        self.flags = flags;
        self.persist()
    }

    pub fn resolve(&self, scope: &str) -> Result<Arc<IndexEntry>, PmsError> {
        self.entries
            .get(scope)
            .cloned()
            .ok_or_else(|| PmsError::ScopeNotFound(scope.to_string()))
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Add or replace a scope declaration and persist the index resource.
    pub fn declare(&mut self, scope: &str, mut entry: IndexEntry) -> Result<(), PmsError> {
        validate_scope_name(scope)?;
        validate_location(scope, &entry.path)?;
        entry.scope = scope.to_string();
        self.entries.insert(scope.to_string(), Arc::new(entry));
        self.persist()
    }

    /// Hash recorded by the last commit in this process, else the declared one.
    pub fn expected_hash(&self, scope: &str) -> Option<String> {
        let recorded = self
            .recorded_hashes
            .read()
            .ok()
            .and_then(|m| m.get(scope).cloned());
        recorded.or_else(|| {
            self.entries
                .get(scope)
                .and_then(|e| e.expected_hash.clone())
        })
    }

    pub fn record_hash(&self, scope: &str, hash: &str) {
        if let Ok(mut m) = self.recorded_hashes.write() {
            m.insert(scope.to_string(), hash.to_string());
        }
    }

    /// Drop the hash recorded for `scope`, falling back to the declared one.
    pub fn forget_hash(&self, scope: &str) {
        if let Ok(mut m) = self.recorded_hashes.write() {
            m.remove(scope);
        }
    }

    fn persist(&self) -> Result<(), PmsError> {
        let file = IndexFile {
            flags: self.flags,
            scopes: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().clone()))
                .collect(),
        };
        let body = toml::to_string_pretty(&file).map_err(|e| PmsError::ConfigError(e.to_string()))?;
        write_file_atomic(&self.path, body.as_bytes())
    }
}
