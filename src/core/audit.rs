//! Append-only audit trail of every access attempt.
//!
//! One JSON object per line in `.pms/audit.events.jsonl`. Appends are
//! serialized in-process by a mutex and across processes by an exclusive
//! `flock` on the log file. The wait for both shares one deadline. A failed
//! append never fails the operation being audited; it bumps a counter and logs
//! at `error`.

use crate::core::error::PmsError;
use crate::core::time;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, TryLockError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::error;

const TAIL_LIMIT: usize = 1000;
const TAIL_TRIM_TO: usize = 500;
const APPEND_RETRY: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    Read,
    Write,
    Rollback,
}

impl fmt::Display for AuditOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditOp::Read => "read",
            AuditOp::Write => "write",
            AuditOp::Rollback => "rollback",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub ts: String,
    pub event_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub scope: String,
    pub operation: AuditOp,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditRecord {
    /// Denied by a permission rule, whether enforced or advisory.
    pub fn is_violation(&self) -> bool {
        self.reason
            .as_deref()
            .map(|r| {
                r.starts_with("advisory_denial")
                    || (!self.success && (r.starts_with("permission") || r.starts_with("agent_not_found")))
            })
            .unwrap_or(false)
    }
}

/// Formats an error as an audit reason: `<kind>: <message>`.
pub fn reason_for(err: &PmsError) -> String {
    format!("{}: {}", err.kind(), err)
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ViolationSummary {
    pub total_violations: usize,
    pub agents_with_violations: Vec<String>,
    /// Most frequently denied scopes, at most five, highest count first.
    pub top_scopes: Vec<(String, usize)>,
}

pub fn summarize_violations(records: &[AuditRecord]) -> ViolationSummary {
    let mut agents = BTreeSet::new();
    let mut by_scope: HashMap<&str, usize> = HashMap::new();
    let mut total = 0;
    for r in records.iter().filter(|r| r.is_violation()) {
        total += 1;
        agents.insert(r.agent_id.clone());
        *by_scope.entry(r.scope.as_str()).or_default() += 1;
    }
    let mut top: Vec<(String, usize)> = by_scope
        .into_iter()
        .map(|(s, n)| (s.to_string(), n))
        .collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top.truncate(5);
    ViolationSummary {
        total_violations: total,
        agents_with_violations: agents.into_iter().collect(),
        top_scopes: top,
    }
}

/// Records for `agent`, newest first.
pub fn agent_activity(records: &[AuditRecord], agent: &str, limit: usize) -> Vec<AuditRecord> {
    records
        .iter()
        .rev()
        .filter(|r| r.agent_id == agent)
        .take(limit)
        .cloned()
        .collect()
}

/// Parse an audit log, skipping lines that are not valid records.
pub fn read_log(path: &Path) -> Result<Vec<AuditRecord>, PmsError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PmsError::IoError(e)),
    };
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(PmsError::IoError)?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(rec) = serde_json::from_str::<AuditRecord>(&line) {
            out.push(rec);
        }
    }
    Ok(out)
}

#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    session_id: String,
    timeout: Duration,
    append_guard: Mutex<()>,
    tail: Mutex<VecDeque<AuditRecord>>,
    failures: AtomicU64,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            session_id: time::new_session_id(),
            timeout,
            append_guard: Mutex::new(()),
            tail: Mutex::new(VecDeque::new()),
            failures: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append one record. Infallible from the caller's point of view.
    pub fn record(
        &self,
        agent_id: &str,
        scope: &str,
        operation: AuditOp,
        success: bool,
        reason: Option<String>,
    ) -> AuditRecord {
        let rec = AuditRecord {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            session_id: self.session_id.clone(),
            agent_id: agent_id.to_string(),
            scope: scope.to_string(),
            operation,
            success,
            reason,
        };

        if let Err(e) = self.append(&rec) {
            let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            error!(
                path = %self.path.display(),
                error = %e,
                failures,
                "audit append failed"
            );
        }

        if let Ok(mut tail) = self.tail.lock() {
            tail.push_back(rec.clone());
            if tail.len() > TAIL_LIMIT {
                let excess = tail.len() - TAIL_TRIM_TO;
                tail.drain(..excess);
            }
        }
        rec
    }

    fn append(&self, rec: &AuditRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(rec).map_err(io::Error::other)?;
        line.push('\n');

        // One deadline covers both the in-process queue and the file lock.
        let deadline = Instant::now() + self.timeout;
        let _guard = loop {
            match self.append_guard.try_lock() {
                Ok(g) => break g,
                Err(TryLockError::Poisoned(p)) => break p.into_inner(),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(APPEND_RETRY)
                }
                Err(TryLockError::WouldBlock) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "audit append queue not cleared before timeout",
                    ));
                }
            }
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        loop {
            match f.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => std::thread::sleep(APPEND_RETRY),
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("audit log lock not acquired: {}", e),
                    ));
                }
            }
        }
        let written = f.write_all(line.as_bytes()).and_then(|_| f.flush());
        let _ = FileExt::unlock(&f);
        written
    }

    /// Appends that could not be written since this logger was created.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Most recent in-memory records, oldest first.
    pub fn recent(&self) -> Vec<AuditRecord> {
        self.tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn violation_summary(&self) -> ViolationSummary {
        summarize_violations(&self.recent())
    }

    pub fn agent_activity(&self, agent: &str, limit: usize) -> Vec<AuditRecord> {
        agent_activity(&self.recent(), agent, limit)
    }
}
