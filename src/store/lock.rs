//! State-file lock with stale-owner recovery
//!
//! The lock is a sibling file created with `O_EXCL`, holding
//! `"<pid>:<unix-ms>"`. A lock older than [`STALE_AFTER`] whose recorded
//! pid is no longer alive is treated as abandoned and unlinked.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::StateError;

/// Age after which a lock owned by a dead process may be broken.
pub const STALE_AFTER: Duration = Duration::from_secs(5);

/// Delay between acquisition attempts.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Attempts before giving up with `LockTimeout`.
const MAX_ATTEMPTS: u32 = 20;

/// Held lock on the state file. Released on drop; a missing lock file at
/// release time is not an error.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    /// Acquires the lock, retrying up to ~2 seconds and breaking stale
    /// locks along the way.
    pub async fn acquire(path: &Path) -> Result<Self, StateError> {
        for _ in 0..MAX_ATTEMPTS {
            match try_create(path) {
                Ok(()) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if break_if_stale(path) {
                        continue;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(StateError::Io(e)),
            }
        }
        Err(StateError::LockTimeout {
            path: path.display().to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to release state lock {:?}: {}", self.path, e);
            }
        }
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    write!(file, "{}:{}", std::process::id(), unix_millis())?;
    Ok(())
}

/// Unlinks the lock if it is stale. Returns true when the caller should
/// retry immediately.
fn break_if_stale(path: &Path) -> bool {
    let Some((pid, created_ms)) = read_owner(path) else {
        // Unreadable or malformed lock: age it out via mtime if we can.
        return false;
    };

    let age = unix_millis().saturating_sub(created_ms);
    if Duration::from_millis(age) <= STALE_AFTER || pid_alive(pid) {
        return false;
    }

    warn!(
        "Breaking stale state lock {:?} (owner pid {} is gone)",
        path, pid
    );
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("Failed to break stale lock {:?}: {}", path, e);
            false
        }
    }
}

fn read_owner(path: &Path) -> Option<(u32, u64)> {
    let contents = std::fs::read_to_string(path).ok()?;
    let (pid, ms) = contents.trim().split_once(':')?;
    Some((pid.parse().ok()?, ms.parse().ok()?))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether a process with this pid exists. Signal 0 probes without
/// delivering; EPERM still means the process is there.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Pids outside pid_t range cannot name a live process, and 0 would
    // probe our own process group.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No cheap probe; err on the side of respecting the lock.
    true
}
