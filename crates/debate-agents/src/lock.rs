//! Single-instance guard.
//!
//! Two loops writing the same state directory would interleave commits, so
//! startup takes a PID lock file and refuses to run while another live
//! process holds it. The file is created exclusively; a lock left by a dead
//! process is removed and the exclusive create retried.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use debate_engine::persistence;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance (pid {pid}) holds {}", path.display())]
    Held { pid: u32, path: PathBuf },

    #[error("lock file {} is being claimed by another instance", path.display())]
    Contended { path: PathBuf },

    #[error("lock file {} unusable: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: persistence::PersistenceError,
    },
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Whether `pid` names a running process.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}

/// Without procfs there is no cheap liveness check; treat every holder as live.
#[cfg(not(target_os = "linux"))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    record: LockRecord,
}

/// An empty lock file younger than this may still be mid-write.
const FRESH_LOCK_GRACE: Duration = Duration::from_secs(2);

const ACQUIRE_ATTEMPTS: usize = 3;

/// Create `path` only if it does not exist, then write `record` into it.
fn create_exclusive(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()
}

fn io_failure(lock: &Path, at: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: lock.to_path_buf(),
        source: persistence::PersistenceError::io(at, source),
    }
}

fn is_fresh_and_empty(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| {
        meta.len() == 0
            && meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age < FRESH_LOCK_GRACE)
    })
}

impl InstanceLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| io_failure(&path, parent, e))?;
        }

        let record = LockRecord {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        for _ in 0..ACQUIRE_ATTEMPTS {
            match create_exclusive(&path, &record) {
                Ok(()) => {
                    info!(pid = record.pid, path = %path.display(), "Instance lock acquired");
                    return Ok(Self { path, record });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_failure(&path, &path, e)),
            }

            match persistence::load_json::<LockRecord>(&path) {
                Ok(Some(existing)) if process_alive(existing.pid) => {
                    return Err(LockError::Held {
                        pid: existing.pid,
                        path,
                    });
                }
                Ok(Some(existing)) => {
                    warn!(
                        pid = existing.pid,
                        since = %existing.started_at,
                        path = %path.display(),
                        "Taking over stale lock"
                    );
                }
                // Removed by its holder between our create and read.
                Ok(None) => continue,
                Err(_) if is_fresh_and_empty(&path) => {
                    return Err(LockError::Contended { path });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Replacing unreadable lock file");
                }
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_failure(&path, &path, e)),
            }
        }
        Err(LockError::Contended { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Leave the file alone if someone else has since taken it over.
        let ours = matches!(
            persistence::load_json::<LockRecord>(&self.path),
            Ok(Some(ref r)) if r.pid == self.record.pid && r.started_at == self.record.started_at
        );
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
            }
        }
    }
}
