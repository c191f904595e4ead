//! Cross-process advisory file lock via exclusive lock-file creation.
//!
//! For a protected path `P` the lock file is `P.lock`, created with
//! `O_CREAT | O_EXCL` and carrying `{pid, host, started_at, writer}` metadata
//! so contending writers can detect a stale holder. The same protocol is
//! spoken by every writer that touches per-run state, the run index, or the
//! memory graph — in-process or not — so the file layout and staleness rule
//! must not drift.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default deadline for acquiring a lock.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll cadence while waiting for a contended lock.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// A lock older than this is eligible for reclaim.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock on {} within {timeout:?}", .path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("lock io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata written into the lock file for stale detection.
#[derive(Debug, Serialize, Deserialize)]
struct LockMeta {
    pid: u32,
    host: String,
    /// Unix seconds, fractional — shared spelling across writer implementations.
    started_at: f64,
    writer: String,
}

/// Held lock. Unlinks the lock file on drop, so release happens on every
/// exit path including panics and future cancellation.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to release lock {}: {}", self.lock_path.display(), e);
            }
        }
    }
}

impl FileLock {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquire the lock for `target`, blocking the current thread.
    ///
    /// Polls every ~100 ms until `timeout`, reclaiming stale locks along the
    /// way. Callers on the async runtime should prefer [`FileLock::acquire_async`].
    pub fn acquire(target: &Path, writer: &str, timeout: Duration) -> Result<Self, LockError> {
        let lock_path = lock_path_for(target);
        let deadline = Instant::now() + timeout;

        loop {
            match try_create(&lock_path, writer) {
                Ok(Some(lock)) => return Ok(lock),
                Ok(None) => {}
                Err(e) => {
                    return Err(LockError::Io {
                        path: lock_path,
                        source: e,
                    })
                }
            }

            if reclaim_if_stale(&lock_path) {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    path: target.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Async flavor of [`FileLock::acquire`]: identical protocol, but the
    /// poll wait yields to the runtime instead of blocking the thread.
    pub async fn acquire_async(
        target: &Path,
        writer: &str,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        let lock_path = lock_path_for(target);
        let deadline = Instant::now() + timeout;

        loop {
            match try_create(&lock_path, writer) {
                Ok(Some(lock)) => return Ok(lock),
                Ok(None) => {}
                Err(e) => {
                    return Err(LockError::Io {
                        path: lock_path,
                        source: e,
                    })
                }
            }

            if reclaim_if_stale(&lock_path) {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    path: target.to_path_buf(),
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Attempt the exclusive create. `Ok(Some)` means we hold the lock,
/// `Ok(None)` means another writer does.
fn try_create(lock_path: &Path, writer: &str) -> std::io::Result<Option<FileLock>> {
    match OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(mut file) => {
            let meta = LockMeta {
                pid: std::process::id(),
                host: host_name(),
                started_at: unix_now(),
                writer: writer.to_string(),
            };
            let json = serde_json::to_string(&meta).unwrap_or_default();
            file.write_all(json.as_bytes())?;
            file.flush()?;
            Ok(Some(FileLock {
                lock_path: lock_path.to_path_buf(),
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove the lock file if its holder is stale. Returns true when the caller
/// should immediately retry acquisition.
fn reclaim_if_stale(lock_path: &Path) -> bool {
    if !is_stale(lock_path) {
        return false;
    }
    match std::fs::remove_file(lock_path) {
        Ok(()) => {
            tracing::warn!("Reclaimed stale lock {}", lock_path.display());
            true
        }
        // Another contender removed it first; retry either way.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(_) => false,
    }
}

/// A lock is stale when its `started_at` exceeds [`STALE_AFTER`] and, for a
/// holder on this host, the recorded pid is no longer alive. A live same-host
/// pid keeps the lock regardless of age. Unreadable metadata falls back to
/// file mtime.
fn is_stale(lock_path: &Path) -> bool {
    let content = match std::fs::read_to_string(lock_path) {
        Ok(c) => c,
        Err(_) => return false,
    };
    let meta: LockMeta = match serde_json::from_str(&content) {
        Ok(m) => m,
        Err(_) => return mtime_exceeds(lock_path, STALE_AFTER),
    };

    let age = unix_now() - meta.started_at;
    if age < STALE_AFTER.as_secs_f64() {
        return false;
    }
    if meta.host == host_name() && meta.pid != 0 {
        return !pid_alive(meta.pid);
    }
    true
}

fn mtime_exceeds(path: &Path, threshold: Duration) -> bool {
    match path.metadata().and_then(|m| m.modified()) {
        Ok(modified) => match modified.elapsed() {
            Ok(age) => age > threshold,
            Err(_) => false,
        },
        Err(_) => false,
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Signal 0 probes process existence without touching it. EPERM still means
/// the pid is alive.
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs no action beyond the existence and
    // permission checks.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn acquire_creates_and_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");

        let lock = FileLock::acquire(&target, "test", DEFAULT_TIMEOUT).unwrap();
        let lock_path = lock.lock_path().to_path_buf();
        assert_eq!(lock_path, dir.path().join("state.json.lock"));
        assert!(lock_path.exists());

        drop(lock);
        assert!(!lock_path.exists());
    }

    #[test]
    fn metadata_carries_pid_host_writer() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.json");

        let lock = FileLock::acquire(&target, "review-api", DEFAULT_TIMEOUT).unwrap();
        let content = std::fs::read_to_string(lock.lock_path()).unwrap();
        let meta: LockMeta = serde_json::from_str(&content).unwrap();
        assert_eq!(meta.pid, std::process::id());
        assert_eq!(meta.writer, "review-api");
        assert!(meta.started_at > 0.0);
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");

        let _held = FileLock::acquire(&target, "holder", DEFAULT_TIMEOUT).unwrap();
        let err = FileLock::acquire(&target, "contender", Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn fresh_lock_of_dead_pid_is_not_reclaimed() {
        // Dead owner but age under the staleness threshold: holder wins.
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        let lock_path = dir.path().join("state.json.lock");

        let meta = LockMeta {
            pid: 0xFFFF_FF0,
            host: host_name(),
            started_at: unix_now(),
            writer: "ghost".into(),
        };
        std::fs::write(&lock_path, serde_json::to_string(&meta).unwrap()).unwrap();

        let err = FileLock::acquire(&target, "contender", Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn stale_dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        let lock_path = dir.path().join("state.json.lock");

        // An hour-old lock held by a pid that cannot exist.
        let meta = LockMeta {
            pid: 0xFFFF_FF0,
            host: host_name(),
            started_at: unix_now() - 3600.0,
            writer: "ghost".into(),
        };
        std::fs::write(&lock_path, serde_json::to_string(&meta).unwrap()).unwrap();

        let lock = FileLock::acquire(&target, "contender", DEFAULT_TIMEOUT).unwrap();
        let content = std::fs::read_to_string(lock.lock_path()).unwrap();
        let meta: LockMeta = serde_json::from_str(&content).unwrap();
        assert_eq!(meta.writer, "contender");
    }

    #[test]
    fn stale_live_owner_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        let lock_path = dir.path().join("state.json.lock");

        // Old lock, but the recorded pid (ours) is alive.
        let meta = LockMeta {
            pid: std::process::id(),
            host: host_name(),
            started_at: unix_now() - 3600.0,
            writer: "long-runner".into(),
        };
        std::fs::write(&lock_path, serde_json::to_string(&meta).unwrap()).unwrap();

        let err = FileLock::acquire(&target, "contender", Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn foreign_host_stale_by_age_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("graph.json");
        let lock_path = dir.path().join("graph.json.lock");

        let meta = LockMeta {
            pid: 1,
            host: "some-other-box".into(),
            started_at: unix_now() - 120.0,
            writer: "remote".into(),
        };
        std::fs::write(&lock_path, serde_json::to_string(&meta).unwrap()).unwrap();

        assert!(FileLock::acquire(&target, "contender", DEFAULT_TIMEOUT).is_ok());
    }

    #[tokio::test]
    async fn async_acquire_serializes_writers() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("index.json");

        let first = FileLock::acquire_async(&target, "a", DEFAULT_TIMEOUT).await.unwrap();

        let target2 = target.clone();
        let waiter = tokio::spawn(async move {
            FileLock::acquire_async(&target2, "b", DEFAULT_TIMEOUT).await
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(first);

        let second = waiter.await.unwrap().unwrap();
        assert!(second.lock_path().exists());
    }
}
