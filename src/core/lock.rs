//! Per-scope advisory write locks.
//!
//! One lock file per scope under `.pms/locks/`, held with an exclusive `flock`
//! (via `fs2`) for the lifetime of a [`ScopeLock`]. The kernel drops the flock
//! when its holder exits, so a lock file left behind by a crash is reclaimed by
//! the next acquirer that manages to lock it. The PID written into the file is
//! informational only. Reads never take these locks.

use crate::core::error::PmsError;
use crate::core::store::Store;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Exclusive write lock on one scope. Released on drop.
#[derive(Debug)]
pub struct ScopeLock {
    file: File,
    path: PathBuf,
    scope: String,
    acquired_at: Instant,
}

impl ScopeLock {
    /// Block until the scope's lock is ours or `timeout` elapses.
    pub fn acquire(store: &Store, scope: &str, timeout: Duration) -> Result<Self, PmsError> {
        fs::create_dir_all(store.locks_dir()).map_err(PmsError::IoError)?;
        let lock_path = store.lock_path(scope);
        let started = Instant::now();
        let deadline = started + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(PmsError::IoError)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    // The previous holder unlinks the file on release; if we locked an
                    // orphaned inode, start over on the live path.
                    if !still_linked(&file, &lock_path) {
                        drop(file);
                        continue;
                    }
                    if let Some(pid) = read_holder_pid(&lock_path) {
                        if !is_process_running(pid) {
                            warn!(scope, pid, "reclaiming lock left by dead process");
                        }
                    }
                    let mut file = file;
                    file.set_len(0).map_err(PmsError::IoError)?;
                    writeln!(file, "{}", std::process::id()).map_err(PmsError::IoError)?;
                    file.sync_all().map_err(PmsError::IoError)?;
                    debug!(
                        scope,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "scope lock acquired"
                    );
                    return Ok(Self {
                        file,
                        path: lock_path,
                        scope: scope.to_string(),
                        acquired_at: Instant::now(),
                    });
                }
                Err(err) if is_contended(&err) => {
                    drop(file);
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PmsError::Timeout {
                            scope: scope.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => return Err(PmsError::IoError(err)),
            }
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// True while some open file holds the scope's flock.
    pub fn is_held(store: &Store, scope: &str) -> bool {
        let file = match OpenOptions::new().read(true).open(store.lock_path(scope)) {
            Ok(f) => f,
            Err(_) => return false,
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(err) => is_contended(&err),
        }
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        // Unlink before unlocking so waiters that locked the old inode notice and retry.
        let _ = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
        debug!(scope = %self.scope, held_ms = self.held_for().as_millis() as u64, "scope lock released");
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(on_disk)) => held.ino() == on_disk.ino() && held.dev() == on_disk.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Liveness check for a lock holder.
pub fn is_process_running(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    #[cfg(unix)]
    {
        // Without procfs we cannot tell, so never reclaim.
        if !Path::new("/proc/self").exists() {
            return true;
        }
        Path::new(&format!("/proc/{}", pid)).exists()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
