//! Document store: the load / save / rollback API over declared scopes.
//!
//! Composes the index, the integrity validator, per-scope write locks and the
//! transaction manager. Each scope carries a metadata sidecar (version, hash,
//! timestamp) and, when dual rollback is enabled, a bounded set of backups of
//! prior versions.

use crate::core::audit::{AuditLogger, AuditOp, reason_for};
use crate::core::config::{self, PmsConfig};
use crate::core::error::PmsError;
use crate::core::index::{IndexEntry, ScopeIndex};
use crate::core::integrity::{IntegrityReport, IntegrityValidator, content_hash};
use crate::core::lock::ScopeLock;
use crate::core::store::Store;
use crate::core::time;
use crate::core::transaction::{DiskFs, StagingFs, TransactionManager, write_file_atomic};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const READ_RETRIES: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    ReadOnly,
    #[default]
    Single,
    Dual,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteMode::ReadOnly => "read_only",
            WriteMode::Single => "single",
            WriteMode::Dual => "dual",
        })
    }
}

impl FromStr for WriteMode {
    type Err = PmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_only" => Ok(WriteMode::ReadOnly),
            "single" => Ok(WriteMode::Single),
            "dual" => Ok(WriteMode::Dual),
            other => Err(PmsError::ValidationError(format!(
                "unknown write mode '{}': expected read_only, single or dual",
                other
            ))),
        }
    }
}

/// Content of a scope at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub scope: String,
    pub content: Vec<u8>,
    pub content_hash: String,
    pub last_modified: String,
    /// 0 when the content predates any write through the store.
    pub version: u64,
}

impl Snapshot {
    pub fn text(&self) -> Result<&str, PmsError> {
        std::str::from_utf8(&self.content).map_err(|_| {
            PmsError::ValidationError(format!("scope '{}' content is not UTF-8", self.scope))
        })
    }
}

/// Sidecar record under `.pms/meta/<scope>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMeta {
    pub scope: String,
    pub version: u64,
    pub content_hash: String,
    pub last_modified: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_txn: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SaveReceipt {
    pub scope: String,
    pub version: u64,
    pub content_hash: String,
    pub last_modified: String,
    /// Mode actually used, after any upgrade to dual.
    pub mode: WriteMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,
}

/// One retained version of a scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u64,
    pub content_hash: String,
    pub saved_at: String,
    pub size: u64,
    #[serde(default)]
    pub current: bool,
}

/// A scope's bytes and sidecar as they stood before a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PriorState {
    content: Option<Vec<u8>>,
    meta: Option<DocumentMeta>,
}

#[derive(Debug)]
pub struct DocumentStore {
    store: Store,
    config: PmsConfig,
    index: ScopeIndex,
    validator: IntegrityValidator,
    txns: TransactionManager,
    audit: Arc<AuditLogger>,
}

impl DocumentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PmsError> {
        Self::open_with_fs(root, Arc::new(DiskFs))
    }

    /// Open with a custom filesystem seam for the commit path.
    pub fn open_with_fs(root: impl Into<PathBuf>, fs: Arc<dyn StagingFs>) -> Result<Self, PmsError> {
        let store = Store::new(root);
        let config = config::load_config(&store)?;
        let index = ScopeIndex::load(store.resolve(&config.index_path))?;
        Ok(Self::from_parts(store, config, index, fs))
    }

    pub fn from_parts(
        store: Store,
        config: PmsConfig,
        index: ScopeIndex,
        fs: Arc<dyn StagingFs>,
    ) -> Self {
        let validator = IntegrityValidator::new(config.integrity_policy, &index.flags());
        let txns = TransactionManager::new(store.staging_dir(), fs);
        let audit = Arc::new(AuditLogger::new(
            store.audit_log_path(),
            config.audit_timeout(),
        ));
        Self {
            store,
            config,
            index,
            validator,
            txns,
            audit,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &PmsConfig {
        &self.config
    }

    pub fn index(&self) -> &ScopeIndex {
        &self.index
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    /// Read a scope. Lock-free; integrity is checked per the configured policy.
    pub fn load(&self, scope: &str) -> Result<Snapshot, PmsError> {
        let entry = self.index.resolve(scope)?;
        let mut attempts = 0;
        loop {
            match self.read_current(&entry) {
                Ok(Some(snap)) => return Ok(snap),
                Ok(None) => {
                    debug!(scope, "declared scope has no content yet");
                    return Err(PmsError::ScopeNotFound(scope.to_string()));
                }
                // A writer may sit between its content rename and its metadata
                // update. Retry while it holds the lock or the recorded hash moved.
                Err(e @ PmsError::Integrity { .. })
                    if attempts < READ_RETRIES && self.write_in_flight(scope, &e)? =>
                {
                    attempts += 1;
                    debug!(scope, attempts, error = %e, "hash mismatch during write, retrying");
                    std::thread::sleep(READ_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace a scope's content. Takes the scope's write lock for the duration.
    pub fn save(&self, scope: &str, content: &[u8], mode: WriteMode) -> Result<SaveReceipt, PmsError> {
        self.index.resolve(scope)?;
        if mode == WriteMode::ReadOnly {
            return Err(PmsError::transaction(
                scope,
                "write rejected: mode is read_only",
            ));
        }
        let lock = self.lock(scope)?;
        self.save_locked(&lock, content, mode)
    }

    /// Read-modify-write under the scope's lock. `f` sees the current bytes
    /// (empty when the scope has no content yet).
    pub fn update<T, F>(&self, scope: &str, mode: WriteMode, f: F) -> Result<(T, SaveReceipt), PmsError>
    where
        F: FnOnce(&[u8]) -> Result<(Vec<u8>, T), PmsError>,
    {
        self.index.resolve(scope)?;
        if mode == WriteMode::ReadOnly {
            return Err(PmsError::transaction(
                scope,
                "write rejected: mode is read_only",
            ));
        }
        let lock = self.lock(scope)?;
        let current = self.read_locked(&lock)?;
        let bytes = current.map(|s| s.content).unwrap_or_default();
        let (next, value) = f(&bytes)?;
        let receipt = self.save_locked(&lock, &next, mode)?;
        Ok((value, receipt))
    }

    pub fn lock(&self, scope: &str) -> Result<ScopeLock, PmsError> {
        self.index.resolve(scope)?;
        ScopeLock::acquire(&self.store, scope, self.config.lock_timeout())
    }

    /// Current content of a locked scope, `None` if it has never been written.
    pub fn read_locked(&self, lock: &ScopeLock) -> Result<Option<Snapshot>, PmsError> {
        let entry = self.index.resolve(lock.scope())?;
        self.read_current(&entry)
    }

    /// Commit under a lock the caller already holds.
    pub fn save_locked(
        &self,
        lock: &ScopeLock,
        content: &[u8],
        mode: WriteMode,
    ) -> Result<SaveReceipt, PmsError> {
        let entry = self.index.resolve(lock.scope())?;
        self.commit(&entry, content, mode)
    }

    /// Raw bytes and sidecar of a locked scope, without integrity checks.
    pub(crate) fn capture_locked(&self, lock: &ScopeLock) -> Result<PriorState, PmsError> {
        let entry = self.index.resolve(lock.scope())?;
        Ok(PriorState {
            content: read_optional(&self.store.resolve(&entry.path))?,
            meta: self.read_meta(lock.scope())?,
        })
    }

    /// Put a locked scope back exactly as captured, including an absent document.
    pub(crate) fn revert_locked(&self, lock: &ScopeLock, prior: &PriorState) -> Result<(), PmsError> {
        let entry = self.index.resolve(lock.scope())?;
        let scope = entry.scope.as_str();
        put_back(&self.store.resolve(&entry.path), prior.content.as_deref())?;
        match &prior.meta {
            Some(meta) => {
                self.write_meta(meta)?;
                self.index.record_hash(scope, &meta.content_hash);
            }
            None => {
                remove_if_present(&self.store.meta_path(scope))?;
                self.index.forget_hash(scope);
            }
        }
        info!(scope, version = prior.meta.as_ref().map(|m| m.version).unwrap_or(0), "scope reverted");
        Ok(())
    }

    /// Restore `target_version` from backup as a new version, audited as a rollback by `actor`.
    pub fn rollback(&self, scope: &str, target_version: u64, actor: &str) -> Result<SaveReceipt, PmsError> {
        let result = self.restore(scope, target_version);
        match &result {
            Ok(receipt) => {
                info!(scope, target_version, version = receipt.version, actor, "scope rolled back");
                self.audit.record(
                    actor,
                    scope,
                    AuditOp::Rollback,
                    true,
                    Some(format!("restored version {}", target_version)),
                );
            }
            Err(e) => {
                self.audit
                    .record(actor, scope, AuditOp::Rollback, false, Some(reason_for(e)));
            }
        }
        result
    }

    fn restore(&self, scope: &str, target_version: u64) -> Result<SaveReceipt, PmsError> {
        let entry = self.index.resolve(scope)?;
        let _lock = self.lock(scope)?;
        let current = self.read_meta(scope)?.map(|m| m.version).unwrap_or(0);
        if current == target_version {
            return Err(PmsError::transaction(
                scope,
                format!("version {} is already current", target_version),
            ));
        }
        let dir = self.store.backups_dir(scope);
        let bytes = match fs::read(backup_path(&dir, target_version)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PmsError::transaction(
                    scope,
                    format!("no retained backup for version {}", target_version),
                ));
            }
            Err(e) => return Err(PmsError::IoError(e)),
        };
        let info = read_version_info(&dir, target_version)?;
        if let Some(info) = info {
            self.validator.check(scope, &bytes, &info.content_hash)?;
        }
        self.commit_entry(&entry, &bytes, WriteMode::Dual)
    }

    /// Retained versions plus the current one, oldest first.
    pub fn history(&self, scope: &str) -> Result<Vec<VersionInfo>, PmsError> {
        self.index.resolve(scope)?;
        let dir = self.store.backups_dir(scope);
        let mut versions = Vec::new();
        for version in retained_versions(&dir)? {
            if let Some(info) = read_version_info(&dir, version)? {
                versions.push(info);
            }
        }
        if let Some(meta) = self.read_meta(scope)? {
            let entry = self.index.resolve(scope)?;
            let size = fs::metadata(self.store.resolve(&entry.path))
                .map(|m| m.len())
                .unwrap_or(0);
            versions.retain(|v| v.version != meta.version);
            versions.push(VersionInfo {
                version: meta.version,
                content_hash: meta.content_hash,
                saved_at: meta.last_modified,
                size,
                current: true,
            });
        }
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    /// Non-raising integrity check of one scope.
    pub fn verify(&self, scope: &str) -> Result<IntegrityReport, PmsError> {
        let entry = self.index.resolve(scope)?;
        let path = self.store.resolve(&entry.path);
        let expected = self.expected_hash(scope)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(IntegrityReport {
                    scope: scope.to_string(),
                    ok: expected.is_none(),
                    expected,
                    actual: None,
                    detail: format!("no content at {}", entry.path.display()),
                });
            }
            Err(e) => return Err(PmsError::IoError(e)),
        };
        let actual = content_hash(&bytes);
        let (ok, detail) = match &expected {
            Some(exp) if *exp != actual => (false, "content hash does not match recorded hash".to_string()),
            _ => match self.validator.validate_structure(&entry, &bytes) {
                Ok(()) if expected.is_some() => (true, "hash matches".to_string()),
                Ok(()) => (true, "no recorded hash".to_string()),
                Err(e) => (false, e),
            },
        };
        Ok(IntegrityReport {
            scope: scope.to_string(),
            ok,
            expected,
            actual: Some(actual),
            detail,
        })
    }

    pub fn verify_all(&self) -> Result<Vec<IntegrityReport>, PmsError> {
        self.index.scopes().map(|s| self.verify(s)).collect()
    }

    /// Version number of the last committed write, 0 if none.
    pub fn current_version(&self, scope: &str) -> Result<u64, PmsError> {
        self.index.resolve(scope)?;
        Ok(self.read_meta(scope)?.map(|m| m.version).unwrap_or(0))
    }

    fn write_in_flight(&self, scope: &str, err: &PmsError) -> Result<bool, PmsError> {
        if ScopeLock::is_held(&self.store, scope) {
            return Ok(true);
        }
        let PmsError::Integrity { expected, .. } = err else {
            return Ok(false);
        };
        Ok(self.expected_hash(scope)?.as_deref() != Some(expected.as_str()))
    }

    fn expected_hash(&self, scope: &str) -> Result<Option<String>, PmsError> {
        Ok(self
            .read_meta(scope)?
            .map(|m| m.content_hash)
            .or_else(|| self.index.expected_hash(scope)))
    }

    fn read_current(&self, entry: &IndexEntry) -> Result<Option<Snapshot>, PmsError> {
        let scope = entry.scope.as_str();
        let path = self.store.resolve(&entry.path);
        let content = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PmsError::IoError(e)),
        };
        let meta = self.read_meta(scope)?;
        let hash = content_hash(&content);
        if self.validator.should_check(entry) {
            let expected = meta
                .as_ref()
                .map(|m| m.content_hash.clone())
                .or_else(|| self.index.expected_hash(scope));
            if let Some(expected) = expected {
                self.validator.check(scope, &content, &expected)?;
            }
        }
        let (version, last_modified) = match meta {
            Some(m) => (m.version, m.last_modified),
            None => (0, modified_epoch_z(&path)),
        };
        Ok(Some(Snapshot {
            scope: scope.to_string(),
            content,
            content_hash: hash,
            last_modified,
            version,
        }))
    }

    fn commit(&self, entry: &IndexEntry, content: &[u8], mode: WriteMode) -> Result<SaveReceipt, PmsError> {
        if mode == WriteMode::ReadOnly {
            return Err(PmsError::transaction(
                &entry.scope,
                "write rejected: mode is read_only",
            ));
        }
        self.commit_entry(entry, content, mode)
    }

    fn commit_entry(&self, entry: &IndexEntry, content: &[u8], requested: WriteMode) -> Result<SaveReceipt, PmsError> {
        let scope = entry.scope.as_str();
        let mode = if requested == WriteMode::Single && entry.requires_dual() {
            debug!(scope, "single write upgraded to dual");
            WriteMode::Dual
        } else {
            requested
        };
        let target = self.store.resolve(&entry.path);
        let previous = read_optional(&target)?;
        let prior = self.read_meta(scope)?;
        let version = prior.as_ref().map(|m| m.version).unwrap_or(0) + 1;
        let hash = content_hash(content);

        let txn_id = match mode {
            WriteMode::Dual => {
                if self.index.flags().dual_rollback_enabled {
                    self.backup_current(scope, &target, previous.as_deref(), prior.as_ref())?;
                }
                let validator = self.validator;
                let record = self
                    .txns
                    .execute(scope, &target, content, |bytes| validator.validate_structure(entry, bytes))?;
                Some(record.id)
            }
            _ => {
                self.validator
                    .validate_structure(entry, content)
                    .map_err(|e| PmsError::transaction(scope, format!("validation failed: {}", e)))?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(PmsError::IoError)?;
                }
                fs::write(&target, content).map_err(PmsError::IoError)?;
                let verified = fs::read(&target)
                    .map_err(PmsError::IoError)
                    .and_then(|written| self.validator.check(scope, &written, &hash));
                if let Err(e) = verified {
                    self.undo_content(scope, &target, previous.as_deref());
                    return Err(e);
                }
                None
            }
        };

        let meta = DocumentMeta {
            scope: scope.to_string(),
            version,
            content_hash: hash.clone(),
            last_modified: time::now_epoch_z(),
            last_txn: txn_id.clone(),
        };
        // Content and sidecar change together or not at all.
        if let Err(e) = self.write_meta(&meta) {
            self.undo_content(scope, &target, previous.as_deref());
            return Err(PmsError::transaction(
                scope,
                format!("metadata update failed: {}", e),
            ));
        }
        self.index.record_hash(scope, &hash);
        info!(scope, version, %mode, "scope saved");

        Ok(SaveReceipt {
            scope: scope.to_string(),
            version,
            content_hash: hash,
            last_modified: meta.last_modified,
            mode,
            txn_id,
        })
    }

    fn undo_content(&self, scope: &str, target: &Path, previous: Option<&[u8]>) {
        if let Err(e) = put_back(target, previous) {
            error!(scope, error = %e, "could not restore content after failed commit");
        }
    }

    fn backup_current(
        &self,
        scope: &str,
        target: &Path,
        previous: Option<&[u8]>,
        prior: Option<&DocumentMeta>,
    ) -> Result<(), PmsError> {
        let Some(bytes) = previous else {
            return Ok(());
        };
        let version = prior.map(|m| m.version).unwrap_or(0);
        let dir = self.store.backups_dir(scope);
        let info = VersionInfo {
            version,
            content_hash: content_hash(bytes),
            saved_at: prior
                .map(|m| m.last_modified.clone())
                .unwrap_or_else(|| modified_epoch_z(target)),
            size: bytes.len() as u64,
            current: false,
        };
        write_file_atomic(&backup_path(&dir, version), bytes)?;
        write_file_atomic(&info_path(&dir, version), serde_json::to_string_pretty(&info)?.as_bytes())?;
        self.prune_backups(scope, &dir)
    }

    fn prune_backups(&self, scope: &str, dir: &Path) -> Result<(), PmsError> {
        let versions = retained_versions(dir)?;
        let keep = self.config.backup_retention;
        if versions.len() <= keep {
            return Ok(());
        }
        for version in &versions[..versions.len() - keep] {
            debug!(scope, version, "pruning backup");
            for path in [backup_path(dir, *version), info_path(dir, *version)] {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(scope, path = %path.display(), error = %e, "could not prune backup");
                    }
                }
            }
        }
        Ok(())
    }

    fn read_meta(&self, scope: &str) -> Result<Option<DocumentMeta>, PmsError> {
        match fs::read_to_string(self.store.meta_path(scope)) {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PmsError::IoError(e)),
        }
    }

    fn write_meta(&self, meta: &DocumentMeta) -> Result<(), PmsError> {
        let body = serde_json::to_string_pretty(meta)?;
        self.txns
            .write_sidecar(&self.store.meta_path(&meta.scope), body.as_bytes())
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PmsError> {
    match fs::read(path) {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PmsError::IoError(e)),
    }
}

fn remove_if_present(path: &Path) -> Result<(), PmsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PmsError::IoError(e)),
    }
}

/// Write `previous` back to `target`, or remove `target` if it did not exist.
fn put_back(target: &Path, previous: Option<&[u8]>) -> Result<(), PmsError> {
    match previous {
        Some(bytes) => write_file_atomic(target, bytes),
        None => remove_if_present(target),
    }
}

fn backup_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{}.bak", version))
}

fn info_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{}.json", version))
}

fn read_version_info(dir: &Path, version: u64) -> Result<Option<VersionInfo>, PmsError> {
    match fs::read_to_string(info_path(dir, version)) {
        Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PmsError::IoError(e)),
    }
}

/// Backed-up version numbers, ascending.
fn retained_versions(dir: &Path) -> Result<Vec<u64>, PmsError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PmsError::IoError(e)),
    };
    let mut versions: Vec<u64> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.strip_suffix(".bak").and_then(|v| v.parse().ok())
        })
        .collect();
    versions.sort_unstable();
    Ok(versions)
}

fn modified_epoch_z(path: &Path) -> String {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| format!("{}Z", d.as_secs()))
        .unwrap_or_else(time::now_epoch_z)
}
