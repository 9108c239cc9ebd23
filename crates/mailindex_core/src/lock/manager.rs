//! Shared/exclusive index locking with lock generations.

use crate::error::{CoreError, CoreResult};
use crate::lock::wait::{is_contended, retry_until};
use crate::lock::LockMethod;
use fs2::FileExt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The first lock generation handed out.
const INITIAL_LOCK_ID: u32 = 2;

/// A handle returned by a successful lock call.
///
/// Even ids are shared locks, odd ids exclusive. Ids from an older lock
/// generation are stale: unlocking them is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockId(u32);

impl LockId {
    /// Returns the raw generation value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns true for exclusive lock ids.
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        self.0 & 1 == 1
    }
}

/// The OS-level lock currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// Nothing held.
    Unlocked,
    /// A shared lock.
    Shared,
    /// An exclusive lock.
    Exclusive,
}

/// Reference-counted shared/exclusive locking of one index file.
///
/// Requests compatible with what is already held are served from the
/// counters without touching the OS: a shared request while anything is
/// held, an exclusive request while exclusive. Exclusive acquisition is
/// always a single non-blocking attempt. A caller that gets
/// [`CoreError::LockWouldBlock`] rewrites the file through a dotlock
/// instead of waiting, so an index lock is never waited on while the log
/// lock is held by someone else.
///
/// With [`LockMethod::Dotlock`] shared locks are bookkeeping only and
/// exclusive locks are always refused, which forces every write through a
/// full recreate.
///
/// # Example
///
/// ```rust
/// use mailindex_core::{LockManager, LockMethod};
/// use std::time::Duration;
///
/// let dir = tempfile::tempdir().unwrap();
/// let file = std::fs::File::create(dir.path().join("index")).unwrap();
/// let mut locks = LockManager::new(dir.path().join("index"), Some(file), LockMethod::Flock);
///
/// let shared = locks.lock_shared(Duration::from_secs(1)).unwrap();
/// assert!(locks.is_valid(shared));
/// locks.unlock(shared);
/// assert!(!locks.is_valid(shared));
/// ```
#[derive(Debug)]
pub struct LockManager {
    path: PathBuf,
    method: LockMethod,
    file: Option<File>,
    lock_type: LockType,
    shared_count: u32,
    excl_count: u32,
    lock_id_counter: u32,
}

impl LockManager {
    /// Creates a lock manager for `path`.
    ///
    /// `file` is the open index file the advisory locks are taken on;
    /// `None` for an index that has no file yet or lives only in memory, in
    /// which case locks are bookkeeping only.
    pub fn new(path: impl Into<PathBuf>, file: Option<File>, method: LockMethod) -> Self {
        Self {
            path: path.into(),
            method,
            file,
            lock_type: LockType::Unlocked,
            shared_count: 0,
            excl_count: 0,
            lock_id_counter: INITIAL_LOCK_ID,
        }
    }

    /// Returns the locked file's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file locks are taken on.
    #[must_use]
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Returns the locking discipline.
    #[must_use]
    pub const fn method(&self) -> LockMethod {
        self.method
    }

    /// Returns the lock currently held.
    #[must_use]
    pub const fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// Returns the number of outstanding shared locks.
    #[must_use]
    pub const fn shared_count(&self) -> u32 {
        self.shared_count
    }

    /// Returns the number of outstanding exclusive locks.
    #[must_use]
    pub const fn excl_count(&self) -> u32 {
        self.excl_count
    }

    /// Returns true if `id` belongs to the current lock generation and a
    /// lock is held.
    #[must_use]
    pub const fn is_valid(&self, id: LockId) -> bool {
        !matches!(self.lock_type, LockType::Unlocked) && (self.lock_id_counter ^ id.0) <= 1
    }

    /// Acquires a shared lock, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if another process kept an exclusive lock for
    /// the whole timeout, or an I/O error.
    pub fn lock_shared(&mut self, timeout: Duration) -> CoreResult<LockId> {
        if self.lock_type != LockType::Unlocked {
            self.shared_count += 1;
            return Ok(LockId(self.lock_id_counter));
        }

        if self.method == LockMethod::Flock {
            if let Some(file) = &self.file {
                if !try_until(timeout, || FileExt::try_lock_shared(file))? {
                    tracing::debug!(path = %self.path.display(), "timed out waiting for shared lock");
                    return Err(CoreError::LockTimeout {
                        path: self.path.clone(),
                    });
                }
            }
        }

        self.lock_type = LockType::Shared;
        self.shared_count += 1;
        Ok(LockId(self.lock_id_counter))
    }

    /// Makes a single non-blocking attempt to acquire an exclusive lock.
    ///
    /// Upgrading a held shared lock is allowed. With flock a failed upgrade
    /// can release the shared lock underneath; it is re-acquired here,
    /// waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `LockWouldBlock` if the lock is held elsewhere or the
    /// dotlock discipline is in use, `LockTimeout` if a lost shared lock
    /// could not be restored, or an I/O error.
    pub fn try_lock_exclusive(&mut self, timeout: Duration) -> CoreResult<LockId> {
        if self.lock_type == LockType::Exclusive {
            self.excl_count += 1;
            return Ok(LockId(self.lock_id_counter + 1));
        }

        if self.method == LockMethod::Dotlock {
            return Err(self.would_block());
        }

        if let Some(file) = &self.file {
            match FileExt::try_lock_exclusive(file) {
                Ok(()) => {}
                Err(err) if is_contended(&err) => {
                    if self.lock_type == LockType::Shared {
                        self.restore_shared(timeout)?;
                    }
                    tracing::debug!(path = %self.path.display(), "exclusive lock would block");
                    return Err(self.would_block());
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.lock_type = LockType::Exclusive;
        self.excl_count += 1;
        Ok(LockId(self.lock_id_counter + 1))
    }

    /// Releases a lock.
    ///
    /// Unlocking an id from an older generation does nothing. Dropping the
    /// last exclusive holder while shared holders remain demotes the OS
    /// lock to shared; dropping the last holder of any kind starts a new
    /// generation.
    pub fn unlock(&mut self, id: LockId) {
        if !self.is_valid(id) {
            return;
        }

        if id.is_exclusive() {
            debug_assert!(self.excl_count > 0);
            self.excl_count = self.excl_count.saturating_sub(1);
        } else {
            debug_assert!(self.shared_count > 0);
            self.shared_count = self.shared_count.saturating_sub(1);
        }

        if self.shared_count == 0 && self.excl_count == 0 {
            self.lock_id_counter += 2;
            if let (LockMethod::Flock, Some(file)) = (self.method, &self.file) {
                if let Err(err) = FileExt::unlock(file) {
                    tracing::warn!(path = %self.path.display(), %err, "failed to release index lock");
                }
            }
            self.lock_type = LockType::Unlocked;
        } else if self.excl_count == 0 && self.lock_type == LockType::Exclusive {
            if let Some(file) = &self.file {
                // Converting exclusive to shared cannot conflict with
                // anyone; on the off chance it fails, keep the stronger lock.
                if let Err(err) = FileExt::try_lock_shared(file) {
                    tracing::warn!(path = %self.path.display(), %err, "failed to demote index lock");
                    return;
                }
            }
            self.lock_type = LockType::Shared;
        }
    }

    /// Switches to a newly opened file, invalidating every outstanding
    /// lock id.
    ///
    /// Called after the index was recreated by rename: locks on the old
    /// file no longer protect anything.
    pub fn reopen(&mut self, file: Option<File>) {
        if let (LockMethod::Flock, Some(old)) = (self.method, &self.file) {
            if self.lock_type != LockType::Unlocked {
                let _ = FileExt::unlock(old);
            }
        }
        self.file = file;
        self.lock_type = LockType::Unlocked;
        self.shared_count = 0;
        self.excl_count = 0;
        self.lock_id_counter += 2;
        tracing::debug!(path = %self.path.display(), generation = self.lock_id_counter, "index file reopened");
    }

    fn restore_shared(&mut self, timeout: Duration) -> CoreResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if try_until(timeout, || FileExt::try_lock_shared(file))? {
            return Ok(());
        }
        tracing::error!(path = %self.path.display(), "shared lock lost during failed upgrade");
        self.lock_type = LockType::Unlocked;
        self.shared_count = 0;
        self.lock_id_counter += 2;
        Err(CoreError::LockTimeout {
            path: self.path.clone(),
        })
    }

    fn would_block(&self) -> CoreError {
        CoreError::LockWouldBlock {
            path: self.path.clone(),
        }
    }
}

/// Retries a non-blocking lock call until it succeeds or `timeout` passes.
fn try_until(timeout: Duration, mut attempt: impl FnMut() -> io::Result<()>) -> io::Result<bool> {
    let locked = retry_until(timeout, || match attempt() {
        Ok(()) => Ok(Some(())),
        Err(err) if is_contended(&err) => Ok(None),
        Err(err) => Err(err),
    })?;
    Ok(locked.is_some())
}
