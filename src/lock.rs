//! Per-source writer lock for catalog rebuilds.
//!
//! Each source's rebuild holds an exclusive lock file for its commit window,
//! so two processes never rebuild the same source concurrently while still
//! allowing different sources to build in parallel. Readers are unaffected;
//! the catalog's WAL snapshots handle reader isolation.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// How old a lock file may be before it is considered abandoned.
const STALE_AFTER_SECS: u64 = 600;

/// Exclusive writer lock, released on drop.
#[derive(Debug)]
pub struct SourceLock {
    lock_path: PathBuf,
}

impl SourceLock {
    /// Acquire the writer lock for `source_name`. A stale lock left behind
    /// by a crashed process is cleaned up; an active lock is an error.
    pub fn acquire(cache_dir: &Path, source_name: &str) -> io::Result<Self> {
        let lock_path = cache_dir.join(format!("{source_name}.lock"));

        if lock_path.exists() {
            if Self::is_stale(&lock_path) {
                fs::remove_file(&lock_path)?;
            } else {
                return Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!(
                        "source '{}' is being rebuilt by another process (lock file: {})",
                        source_name,
                        lock_path.display()
                    ),
                ));
            }
        }

        let payload = format!("{} {}", std::process::id(), unix_now());
        fs::write(&lock_path, payload)?;
        Ok(SourceLock { lock_path })
    }

    fn is_stale(lock_path: &Path) -> bool {
        let content = match fs::read_to_string(lock_path) {
            Ok(c) => c,
            Err(_) => return true,
        };
        let timestamp: u64 = match content.split_whitespace().nth(1).and_then(|t| t.parse().ok()) {
            Some(t) => t,
            None => return true,
        };
        unix_now().saturating_sub(timestamp) > STALE_AFTER_SECS
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_creates_and_drop_removes() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("work.lock");
        {
            let _lock = SourceLock::acquire(tmp.path(), "work").unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let tmp = TempDir::new().unwrap();
        let _lock = SourceLock::acquire(tmp.path(), "work").unwrap();
        let err = SourceLock::acquire(tmp.path(), "work").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn different_sources_do_not_contend() {
        let tmp = TempDir::new().unwrap();
        let _a = SourceLock::acquire(tmp.path(), "alpha").unwrap();
        let _b = SourceLock::acquire(tmp.path(), "beta").unwrap();
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("work.lock");
        fs::write(&lock_path, format!("99999 {}", unix_now() - STALE_AFTER_SECS - 5)).unwrap();
        let _lock = SourceLock::acquire(tmp.path(), "work").unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn garbage_lock_content_is_stale() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("work.lock"), "not a lock").unwrap();
        let _lock = SourceLock::acquire(tmp.path(), "work").unwrap();
    }
}
