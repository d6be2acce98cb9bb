//! Advisory lock around store writes.
//!
//! The lock is an exclusive `flock` on a sidecar file. It is polled, never
//! waited on, so a stuck writer turns into a bounded [`SheetError::LockTimeout`]
//! instead of a hung request.

use crate::core::{Result, SheetError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub retry: Duration,
    pub timeout: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retry: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub async fn acquire(path: &Path, policy: LockPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(lock = %path.display(), waited_ms = started.elapsed().as_millis() as u64, "store lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {}
                Err(err) => return Err(err.into()),
            }

            let waited = started.elapsed();
            if waited >= policy.timeout {
                warn!(lock = %path.display(), waited_ms = waited.as_millis() as u64, "gave up waiting for store lock");
                return Err(SheetError::LockTimeout {
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(policy.retry.min(policy.timeout - waited)).await;
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), error = %err, "failed to release store lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quick() -> LockPolicy {
        LockPolicy {
            retry: Duration::from_millis(10),
            timeout: Duration::from_millis(120),
        }
    }

    #[tokio::test]
    async fn second_holder_times_out_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        let held = FileLock::acquire(&path, quick()).await.unwrap();
        let err = FileLock::acquire(&path, quick()).await.unwrap_err();
        assert!(matches!(err, SheetError::LockTimeout { waited_ms } if waited_ms >= 120));

        drop(held);
        assert!(FileLock::acquire(&path, quick()).await.is_ok());
    }
}
