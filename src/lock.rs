//! Cross-process advisory file locks.
//!
//! Two resource classes use different policies. The backlog document is
//! [`LockPolicy::Strict`]: a timed-out wait is an error and nothing is
//! written. Append-only logs and the daemon queue are
//! [`LockPolicy::BestEffort`]: a timed-out wait proceeds without the lock
//! and logs a warning.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::duration_ms;
use crate::error::LockError;

/// Wait-and-retry bounds for lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Total time to keep retrying before giving up.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Sleep between attempts.
    #[serde(rename = "retry_interval_ms", with = "duration_ms")]
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// How a resource class reacts when its lock cannot be acquired in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Give up and report failure.
    Strict,
    /// Proceed without the lock.
    BestEffort,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            debug!(path = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

/// Result of a bounded acquisition attempt.
#[derive(Debug)]
pub enum LockOutcome {
    /// The lock is held until the guard drops.
    Locked(FileLockGuard),
    /// Timed out under [`LockPolicy::BestEffort`]; caller proceeds unlocked.
    TimedOutProceeding,
    /// Timed out under [`LockPolicy::Strict`]; caller must not proceed.
    TimedOutFailing,
}

impl LockOutcome {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockOutcome::Locked(_))
    }
}

/// Try to take an exclusive lock on `path`, retrying until `config.timeout`.
pub fn acquire(
    path: &Path,
    policy: LockPolicy,
    config: &LockConfig,
) -> Result<LockOutcome, LockError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let start = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                return Ok(LockOutcome::Locked(FileLockGuard {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(_) if start.elapsed() < config.timeout => {
                std::thread::sleep(config.retry_interval);
            }
            Err(_) => {
                return Ok(match policy {
                    LockPolicy::Strict => LockOutcome::TimedOutFailing,
                    LockPolicy::BestEffort => LockOutcome::TimedOutProceeding,
                });
            }
        }
    }
}

/// Acquire under the strict policy, turning a timeout into an error.
pub fn acquire_strict(path: &Path, config: &LockConfig) -> Result<FileLockGuard, LockError> {
    match acquire(path, LockPolicy::Strict, config)? {
        LockOutcome::Locked(guard) => Ok(guard),
        LockOutcome::TimedOutFailing | LockOutcome::TimedOutProceeding => Err(LockError::Timeout {
            path: path.to_path_buf(),
            waited_ms: config.timeout.as_millis() as u64,
        }),
    }
}

/// Acquire under the best-effort policy. `None` means "proceed unlocked".
pub fn acquire_best_effort(path: &Path, config: &LockConfig) -> Option<FileLockGuard> {
    match acquire(path, LockPolicy::BestEffort, config) {
        Ok(LockOutcome::Locked(guard)) => Some(guard),
        Ok(_) => {
            warn!(
                path = %path.display(),
                waited_ms = config.timeout.as_millis() as u64,
                "lock not acquired in time, proceeding without it"
            );
            None
        }
        Err(err) => {
            warn!(error = %err, "lock unavailable, proceeding without it");
            None
        }
    }
}

/// Lock file path that sits next to the resource it protects.
pub fn lock_path_for(resource: &Path) -> PathBuf {
    let mut name = resource
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    resource.with_file_name(name)
}
