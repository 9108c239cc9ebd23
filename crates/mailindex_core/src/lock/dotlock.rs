//! Dotlocks: `<path>.lock` files created exclusively.
//!
//! Used where advisory locks are unreliable. A dotlock doubles as the
//! staging file for a full rewrite: the new contents are written into the
//! lock file, which is then renamed over the target.

use crate::error::{CoreError, CoreResult};
use crate::lock::wait::retry_until;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Returns the dotlock path for `target`.
#[must_use]
pub fn dotlock_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// A held dotlock. Dropping it removes the lock file.
#[derive(Debug)]
pub struct DotLock {
    target: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
}

impl DotLock {
    /// Creates `<target>.lock`, waiting up to `timeout` for another holder
    /// to release it.
    ///
    /// Lock files older than `stale_timeout` are treated as left behind by
    /// a crashed process and removed.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock could not be created in time, or an
    /// I/O error.
    pub fn acquire(target: &Path, timeout: Duration, stale_timeout: Duration) -> CoreResult<Self> {
        let lock_path = dotlock_path(target);
        let file = retry_until(timeout, || {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(file) => Ok(Some(file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    remove_if_stale(&lock_path, stale_timeout)?;
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })?;

        match file {
            Some(file) => {
                tracing::debug!(path = %lock_path.display(), "dotlock acquired");
                Ok(Self {
                    target: target.to_path_buf(),
                    lock_path,
                    file: Some(file),
                })
            }
            None => Err(CoreError::LockTimeout {
                path: lock_path,
            }),
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Writes the complete new contents of the target into the lock file
    /// and forces them to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if writing or syncing fails.
    pub fn write_contents(&mut self, data: &[u8]) -> CoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("dotlock already released"))?;
        file.set_len(0)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    /// Renames the lock file over the target, releasing the lock.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the rename fails; the lock file is removed in
    /// that case.
    pub fn replace(mut self) -> CoreResult<()> {
        self.file = None;
        fs::rename(&self.lock_path, &self.target)?;
        tracing::debug!(path = %self.target.display(), "replaced file from dotlock");
        Ok(())
    }

    /// Removes the lock file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the lock file cannot be removed.
    pub fn release(mut self) -> CoreResult<()> {
        self.file = None;
        fs::remove_file(&self.lock_path)?;
        Ok(())
    }
}

impl Drop for DotLock {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(err) = fs::remove_file(&self.lock_path) {
                tracing::warn!(path = %self.lock_path.display(), %err, "failed to remove dotlock");
            }
        }
    }
}

fn remove_if_stale(lock_path: &Path, stale_timeout: Duration) -> io::Result<()> {
    let modified = match fs::metadata(lock_path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age > stale_timeout {
        tracing::warn!(path = %lock_path.display(), age_secs = age.as_secs(), "removing stale dotlock");
        match fs::remove_file(lock_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LONG: Duration = Duration::from_secs(3600);

    #[test]
    fn second_acquire_times_out() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("index");

        let held = DotLock::acquire(&target, Duration::ZERO, LONG).unwrap();
        assert!(held.lock_path().exists());

        let err = DotLock::acquire(&target, Duration::from_millis(20), LONG).unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));

        drop(held);
        assert!(!dotlock_path(&target).exists());
        DotLock::acquire(&target, Duration::ZERO, LONG).unwrap();
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("index");
        fs::write(dotlock_path(&target), b"").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let lock = DotLock::acquire(&target, Duration::from_secs(1), Duration::ZERO).unwrap();
        lock.release().unwrap();
        assert!(!dotlock_path(&target).exists());
    }

    #[test]
    fn replace_renames_over_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("index");
        fs::write(&target, b"old").unwrap();

        let mut lock = DotLock::acquire(&target, Duration::ZERO, LONG).unwrap();
        lock.write_contents(b"new contents").unwrap();
        lock.replace().unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new contents");
        assert!(!dotlock_path(&target).exists());
    }
}
