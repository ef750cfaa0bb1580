//! Lock file mechanism guaranteeing at-most-one backup pipeline per host.
//!
//! The lock file lives in the state directory (default
//! `/var/run/pmxpack`) and contains JSON metadata about the holder
//! (PID, hostname, acquisition time, tool version). Release is idempotent:
//! releasing a lock that is no longer on disk is a no-op, so the
//! orchestrator can release unconditionally on every exit path.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "backup.lock";

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Hostname where the lock was acquired
    pub hostname: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// Version of the tool that acquired the lock
    pub tool_version: String,
}

/// Lock file handle that releases on Drop.
#[derive(Debug)]
pub struct BackupLock {
    path: PathBuf,
}

impl BackupLock {
    /// Acquire the backup lock in the given state directory.
    ///
    /// Fails if a lock already exists. Use [`BackupLock::acquire_with_timeout`]
    /// to reclaim locks left behind by a crashed run.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let lock_path = state_dir.join(LOCK_FILE);

        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        if lock_path.exists() {
            let existing = read_lock_info_from_path(&lock_path)?;
            bail!(
                "backup already running: lock held by pid {} on {} since {}",
                existing.pid,
                existing.hostname,
                existing.acquired_at
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        };

        // Write via tmp + rename so a concurrent reader never sees a
        // half-written lock.
        let tmp_path = lock_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create lock tmp file {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write lock tmp file {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync lock file")?;
        }
        fs::rename(&tmp_path, &lock_path)
            .with_context(|| format!("failed to rename lock file to {}", lock_path.display()))?;

        Ok(Self { path: lock_path })
    }

    /// Acquire the lock, removing a stale or corrupt leftover first.
    ///
    /// A lock older than `stale_after` is treated as abandoned by a
    /// crashed run and removed; a fresh lock still fails the acquisition.
    pub fn acquire_with_timeout(state_dir: &Path, stale_after: Duration) -> Result<Self> {
        let lock_path = state_dir.join(LOCK_FILE);

        if lock_path.exists() {
            match read_lock_info_from_path(&lock_path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > stale_after.as_secs() {
                        fs::remove_file(&lock_path).with_context(|| {
                            format!("failed to remove stale lock file {}", lock_path.display())
                        })?;
                    } else {
                        bail!(
                            "backup already running: lock held by pid {} on {} since {}",
                            info.pid,
                            info.hostname,
                            info.acquired_at
                        );
                    }
                }
                Err(_) => {
                    // Unparseable lock file; nothing sane can hold it.
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove corrupt lock file {}", lock_path.display())
                    })?;
                }
            }
        }

        Self::acquire(state_dir)
    }

    /// Release the lock. Releasing a non-held lock is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock file {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Check whether a lock file exists in the state directory.
    pub fn is_locked(state_dir: &Path) -> bool {
        state_dir.join(LOCK_FILE).exists()
    }

    /// Read the holder information from the state directory.
    pub fn read_lock_info(state_dir: &Path) -> Result<LockInfo> {
        read_lock_info_from_path(&state_dir.join(LOCK_FILE))
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    let info: LockInfo = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))?;
    Ok(info)
}

/// Get the lock file path for a state directory
pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn acquire_creates_lock_file() {
        let td = tempdir().expect("tempdir");
        let mut lock = BackupLock::acquire(td.path()).expect("acquire");
        assert!(lock_path(td.path()).exists());
        lock.release().expect("release");
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn acquire_fails_when_locked() {
        let td = tempdir().expect("tempdir");
        let _lock = BackupLock::acquire(td.path()).expect("first acquire");

        let result = BackupLock::acquire(td.path());
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("backup already running")
        );
    }

    #[test]
    fn release_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let mut lock = BackupLock::acquire(td.path()).expect("acquire");
        lock.release().expect("first release");
        // Second release finds nothing on disk and still succeeds.
        lock.release().expect("second release");
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().expect("tempdir");
        {
            let _lock = BackupLock::acquire(td.path()).expect("acquire");
            assert!(lock_path(td.path()).exists());
        }
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn lock_info_records_holder() {
        let td = tempdir().expect("tempdir");
        let _lock = BackupLock::acquire(td.path()).expect("acquire");

        let info = BackupLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
        assert_eq!(info.tool_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let td = tempdir().expect("tempdir");

        let path = lock_path(td.path());
        let old_info = LockInfo {
            pid: 12345,
            hostname: "dead-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            tool_version: "0.1.0".to_string(),
        };
        fs::write(&path, serde_json::to_string(&old_info).expect("serialize"))
            .expect("write stale lock");

        let _lock = BackupLock::acquire_with_timeout(td.path(), Duration::from_secs(3600))
            .expect("acquire over stale lock");

        let info = BackupLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn fresh_lock_is_not_reclaimed() {
        let td = tempdir().expect("tempdir");
        let _lock = BackupLock::acquire(td.path()).expect("first acquire");

        let result = BackupLock::acquire_with_timeout(td.path(), Duration::from_secs(3600));
        assert!(result.is_err());
    }

    #[test]
    fn corrupt_lock_is_replaced() {
        let td = tempdir().expect("tempdir");
        fs::write(lock_path(td.path()), b"not json").expect("write garbage");

        let _lock = BackupLock::acquire_with_timeout(td.path(), Duration::from_secs(3600))
            .expect("acquire over corrupt lock");
        let info = BackupLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
    }
}
