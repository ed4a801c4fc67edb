//! Stage / validate / commit write protocol.
//!
//! State machine per write: `idle -> staged -> validated -> committed`, or
//! `idle -> staged -> rollback` on any failure. Proposed content is written to
//! a private staging area first; the target is replaced with a single rename,
//! so a concurrent reader sees either the old bytes or the new bytes in full.
//! Every failure path discards the staged file before the error is returned,
//! leaving the target untouched.

use crate::core::error::PmsError;
use crate::core::integrity::content_hash;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use ulid::Ulid;

const HISTORY_LIMIT: usize = 256;

/// Filesystem seam for the two steps that touch disk. Tests swap in a failing
/// implementation to simulate a full disk or a permission error mid-commit.
pub trait StagingFs: Send + Sync + fmt::Debug {
    fn write_staged(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn replace(&self, staged: &Path, target: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFs;

impl StagingFs for DiskFs {
    fn write_staged(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
        f.write_all(bytes)?;
        f.sync_all()
    }

    fn replace(&self, staged: &Path, target: &Path) -> io::Result<()> {
        fs::rename(staged, target)?;
        sync_parent(target);
        Ok(())
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

/// Write `bytes` to `path` through a sibling temp file and a rename.
/// Used for the store's own bookkeeping files (index, backups).
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), PmsError> {
    write_atomic_with(&DiskFs, path, bytes)
}

fn write_atomic_with(fs_seam: &dyn StagingFs, path: &Path, bytes: &[u8]) -> Result<(), PmsError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(PmsError::IoError)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", name, Ulid::new()));
    let result = fs_seam
        .write_staged(&tmp, bytes)
        .and_then(|_| fs_seam.replace(&tmp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(PmsError::IoError(e));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Staged,
    Validated,
    Committed,
    Rollback,
}

impl TxnState {
    pub fn status(self) -> TransactionStatus {
        match self {
            TxnState::Idle | TxnState::Staged | TxnState::Validated => TransactionStatus::Active,
            TxnState::Committed => TransactionStatus::Committed,
            TxnState::Rollback => TransactionStatus::RolledBack,
        }
    }
}

/// Finished transaction, kept in a bounded in-process history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: String,
    pub scope: String,
    pub started_at: String,
    pub finished_at: String,
    pub status: TransactionStatus,
    pub content_hash: Option<String>,
    pub reason: Option<String>,
}

/// One in-flight write. Owns its staged file until commit or rollback resolves it.
#[derive(Debug)]
pub struct Transaction {
    pub id: String,
    pub scope: String,
    pub started_at: String,
    state: TxnState,
    staged: Option<PathBuf>,
    hash: Option<String>,
}

impl Transaction {
    pub fn state(&self) -> TxnState {
        self.state
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(path) = self.staged.take() {
            let _ = fs::remove_file(path);
        }
    }
}

#[derive(Debug)]
pub struct TransactionManager {
    staging_dir: PathBuf,
    fs: Arc<dyn StagingFs>,
    active: Mutex<HashSet<String>>,
    history: Mutex<VecDeque<TransactionRecord>>,
}

impl TransactionManager {
    pub fn new(staging_dir: impl Into<PathBuf>, fs: Arc<dyn StagingFs>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            fs,
            active: Mutex::new(HashSet::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Run the full protocol for `bytes` against `target`.
    ///
    /// `check` is the scope's structural validation; it sees the staged bytes as
    /// read back from disk. The caller must already hold the scope's write lock.
    pub fn execute<F>(
        &self,
        scope: &str,
        target: &Path,
        bytes: &[u8],
        check: F,
    ) -> Result<TransactionRecord, PmsError>
    where
        F: FnOnce(&[u8]) -> Result<(), String>,
    {
        let mut txn = self.begin(scope)?;
        let outcome = self
            .stage(&mut txn, bytes)
            .and_then(|_| self.validate(&mut txn, bytes, check))
            .and_then(|_| self.commit(&mut txn, target));
        match outcome {
            Ok(()) => Ok(self.finish(txn, None)),
            Err(reason) => {
                let record = self.finish(txn, Some(reason.clone()));
                warn!(scope, txn = %record.id, %reason, "transaction rolled back");
                Err(PmsError::transaction(scope, reason))
            }
        }
    }

    pub fn begin(&self, scope: &str) -> Result<Transaction, PmsError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| PmsError::transaction(scope, "transaction table poisoned"))?;
        if !active.insert(scope.to_string()) {
            return Err(PmsError::transaction(
                scope,
                "another transaction is already active for this scope",
            ));
        }
        let txn = Transaction {
            id: format!("txn_{}", Ulid::new()),
            scope: scope.to_string(),
            started_at: time::now_epoch_z(),
            state: TxnState::Idle,
            staged: None,
            hash: None,
        };
        debug!(scope, txn = %txn.id, "transaction begun");
        Ok(txn)
    }

    fn stage(&self, txn: &mut Transaction, bytes: &[u8]) -> Result<(), String> {
        fs::create_dir_all(&self.staging_dir)
            .map_err(|e| format!("cannot create staging area: {}", e))?;
        let path = self
            .staging_dir
            .join(format!("{}.{}.staged", txn.id, txn.scope));
        // Record the path first so a partial write is still cleaned up.
        txn.staged = Some(path.clone());
        self.fs
            .write_staged(&path, bytes)
            .map_err(|e| format!("staging failed: {}", e))?;
        txn.state = TxnState::Staged;
        Ok(())
    }

    fn validate<F>(&self, txn: &mut Transaction, bytes: &[u8], check: F) -> Result<(), String>
    where
        F: FnOnce(&[u8]) -> Result<(), String>,
    {
        let path = txn.staged.as_ref().ok_or("nothing staged")?;
        let staged = fs::read(path).map_err(|e| format!("cannot re-read staged content: {}", e))?;
        let expected = content_hash(bytes);
        let actual = content_hash(&staged);
        if actual != expected {
            return Err(format!(
                "staged content hash {} does not match proposed content {}",
                actual, expected
            ));
        }
        check(&staged).map_err(|e| format!("validation failed: {}", e))?;
        txn.hash = Some(actual);
        txn.state = TxnState::Validated;
        Ok(())
    }

    fn commit(&self, txn: &mut Transaction, target: &Path) -> Result<(), String> {
        if txn.state != TxnState::Validated {
            return Err("commit attempted before validation".to_string());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("cannot create target directory: {}", e))?;
        }
        let staged = txn.staged.as_ref().ok_or("nothing staged")?;
        self.fs
            .replace(staged, target)
            .map_err(|e| format!("commit failed: {}", e))?;
        txn.staged = None;
        txn.state = TxnState::Committed;
        Ok(())
    }

    fn finish(&self, mut txn: Transaction, failure: Option<String>) -> TransactionRecord {
        if failure.is_some() {
            txn.state = TxnState::Rollback;
            if let Some(path) = txn.staged.take() {
                let _ = fs::remove_file(path);
            }
        }
        if let Ok(mut active) = self.active.lock() {
            active.remove(&txn.scope);
        }
        let record = TransactionRecord {
            id: txn.id.clone(),
            scope: txn.scope.clone(),
            started_at: txn.started_at.clone(),
            finished_at: time::now_epoch_z(),
            status: txn.state.status(),
            content_hash: if failure.is_none() { txn.hash.clone() } else { None },
            reason: failure,
        };
        if record.status == TransactionStatus::Committed {
            info!(scope = %record.scope, txn = %record.id, "transaction committed");
        }
        if let Ok(mut history) = self.history.lock() {
            history.push_back(record.clone());
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
        record
    }

    /// Atomically replace a sidecar that must change together with a commit,
    /// through the same filesystem seam as the commit itself.
    pub fn write_sidecar(&self, path: &Path, bytes: &[u8]) -> Result<(), PmsError> {
        write_atomic_with(self.fs.as_ref(), path, bytes)
    }

    /// Finished transactions for `scope` in this process, oldest first.
    pub fn history(&self, scope: &str) -> Vec<TransactionRecord> {
        self.history
            .lock()
            .map(|h| h.iter().filter(|r| r.scope == scope).cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_active(&self, scope: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(scope))
            .unwrap_or(false)
    }
}
