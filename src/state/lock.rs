//! Single-holder sync lock
//!
//! A path-based advisory lock guarding the analytics store and the state
//! directory. Creation with `create_new` is the atomic acquire; the record
//! inside names the holder for diagnostics and for the staleness rule:
//! a lock whose pid is no longer live on this host AND whose age exceeds
//! the stale threshold may be forcibly replaced.
//!
//! No queuing. A refused caller gets `LockBusy` immediately (after the
//! optional short acquisition timeout) and retries at a higher layer.

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const ACQUIRE_POLL: Duration = Duration::from_millis(50);

/// Contents of the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
}

/// The lock over one analytics store / state directory.
pub struct SyncLock {
    path: PathBuf,
    stale_after: Duration,
}

/// Proof of acquisition. Releasing is idempotent and also happens on drop.
pub struct LockHandle {
    path: PathBuf,
    released: bool,
    /// Holder id of a stale lock this acquisition forcibly replaced, if any.
    pub taken_over: Option<String>,
}

impl LockHandle {
    /// Remove the lock file. Safe to call more than once.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove lock file {:?}: {e}", self.path);
                }
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl SyncLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    /// Try to take the lock, polling for up to `timeout`. A zero timeout is
    /// a single attempt.
    pub fn acquire(&self, holder_id: &str, timeout: Duration) -> Result<LockHandle, SyncError> {
        let deadline = Instant::now() + timeout;
        let mut taken_over = None;

        loop {
            match self.try_create(holder_id) {
                Ok(()) => {
                    return Ok(LockHandle {
                        path: self.path.clone(),
                        released: false,
                        taken_over,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let record = self.read_record();
                    if let Some(record) = &record {
                        if self.is_stale(record) {
                            tracing::warn!(
                                "replacing stale sync lock held by {} (pid {} dead, age {}s)",
                                record.holder_id,
                                record.pid,
                                age_secs(record)
                            );
                            taken_over = Some(record.holder_id.clone());
                            let _ = fs::remove_file(&self.path);
                            continue;
                        }
                    }
                    if Instant::now() >= deadline {
                        let (holder, age) = record
                            .map(|r| {
                                let age = age_secs(&r);
                                (r.holder_id, age)
                            })
                            .unwrap_or_else(|| ("unknown".to_string(), 0));
                        return Err(SyncError::LockBusy {
                            holder,
                            age_secs: age,
                        });
                    }
                    std::thread::sleep(ACQUIRE_POLL);
                }
                Err(e) => return Err(SyncError::StateWriteError(format!("lock: {e}"))),
            }
        }
    }

    /// Whether the lock is currently held, and by whom.
    pub fn is_held(&self) -> Option<(String, u64)> {
        self.read_record().map(|r| {
            let age = age_secs(&r);
            (r.holder_id, age)
        })
    }

    fn try_create(&self, holder_id: &str) -> std::io::Result<()> {
        let record = LockRecord {
            holder_id: holder_id.to_string(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        let mut json = serde_json::to_string_pretty(&record).map_err(std::io::Error::other)?;
        json.push('\n');
        file.write_all(json.as_bytes())?;
        file.sync_all()
    }

    fn read_record(&self) -> Option<LockRecord> {
        let text = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        !pid_alive(record.pid) && Duration::from_secs(age_secs(record)) > self.stale_after
    }
}

fn age_secs(record: &LockRecord) -> u64 {
    (Utc::now() - record.acquired_at).num_seconds().max(0) as u64
}

/// Host-local pid liveness. The staleness rule is single-host by design;
/// where liveness cannot be probed we err on the side of "alive" so a lock
/// is never stolen from a running process.
#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}
