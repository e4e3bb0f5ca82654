//! Cross-process session file locking.
//!
//! Every physical write to a session file happens under a sidecar lock
//! file (`<session>.jsonl.lock`) containing the owner's pid and creation
//! time. A lock is stale once it is older than 30 minutes or its owner
//! pid is no longer alive; stale locks are forcibly removed. Acquisition
//! waits up to 10 seconds with exponential backoff capped at 1 second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use talon_core::error::SessionError;

const LOCK_STALE_AFTER: Duration = Duration::from_secs(30 * 60);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_millis(25);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Contents of a lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

/// An acquired session lock. Released (best-effort) on drop.
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Acquire the lock guarding `file_path`.
    pub async fn acquire(file_path: &Path) -> Result<Self, SessionError> {
        let path = lock_path(file_path);
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        let mut backoff = BACKOFF_INITIAL;

        loop {
            match try_create(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        warn!(lock = %path.display(), "Removing stale session lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(SessionError::LockTimeout {
                            path: path.display().to_string(),
                        });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(err) => return Err(SessionError::Io(err)),
            }
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(lock = %self.path.display(), error = %err, "Failed to remove session lock");
        }
    }
}

fn lock_path(file_path: &Path) -> PathBuf {
    let mut name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".lock");
    file_path.with_file_name(name)
}

fn try_create(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let info = LockInfo {
        pid: std::process::id(),
        created_at: Utc::now(),
    };
    serde_json::to_writer(&file, &info)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(())
}

/// A lock is stale if its metadata is unreadable, its owner is dead, or it
/// exceeds the age limit.
fn is_stale(path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        // Unreadable lock: likely torn write from a crashed owner.
        return true;
    };
    let Ok(info) = serde_json::from_str::<LockInfo>(&raw) else {
        return true;
    };
    if Utc::now() - info.created_at > chrono::Duration::from_std(LOCK_STALE_AFTER).unwrap_or_default()
    {
        return true;
    }
    !pid_alive(info.pid)
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// Without a portable liveness probe, only the age rule applies: never
// steal a possibly-live lock early.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}
