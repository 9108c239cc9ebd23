//! Waiting exclusive locks for the transaction log.

use crate::error::{CoreError, CoreResult};
use crate::lock::wait::{is_contended, retry_until};
use crate::lock::{DotLock, LockMethod};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An exclusive lock on one file, released on drop.
///
/// Unlike index locks, log locks are waited for: the log lock is always
/// taken before any index lock, so waiting cannot deadlock.
#[derive(Debug)]
pub enum FileLock {
    /// An advisory lock held through a private handle to the file.
    Flock {
        /// Locked file path.
        path: PathBuf,
        /// Handle the lock is held on.
        file: File,
    },
    /// A dotlock next to the file.
    Dot(DotLock),
}

impl FileLock {
    /// Locks `path` exclusively, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock was not obtained in time, or an I/O
    /// error.
    pub fn acquire(
        path: &Path,
        method: LockMethod,
        timeout: Duration,
        stale_timeout: Duration,
    ) -> CoreResult<Self> {
        match method {
            LockMethod::Dotlock => Ok(Self::Dot(DotLock::acquire(path, timeout, stale_timeout)?)),
            LockMethod::Flock => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                let locked = retry_until(timeout, || match FileExt::try_lock_exclusive(&file) {
                    Ok(()) => Ok(Some(())),
                    Err(err) if is_contended(&err) => Ok(None),
                    Err(err) => Err(err),
                })?;
                if locked.is_none() {
                    return Err(CoreError::LockTimeout {
                        path: path.to_path_buf(),
                    });
                }
                Ok(Self::Flock {
                    path: path.to_path_buf(),
                    file,
                })
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Self::Flock { path, file } = self {
            if let Err(err) = FileExt::unlock(&*file) {
                tracing::warn!(path = %path.display(), %err, "failed to release file lock");
            }
        }
    }
}
