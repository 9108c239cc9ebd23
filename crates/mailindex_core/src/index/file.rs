//! Reading and writing the index file.

use crate::config::{Config, FsyncMode};
use crate::error::CoreResult;
use crate::index::map::IndexMap;
use crate::lock::{DotLock, LockManager};
use crate::registry::{KeywordId, Registry};
use mailindex_storage::{open_index_bytes, AccessStrategy};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The index file and its locks.
///
/// Maps are read under a shared lock. Writes go in place only when the file
/// is read into buffers (so no process has it mapped) and an exclusive lock
/// is granted without waiting; otherwise the file is recreated: the new
/// image is written into the index's dotlock and renamed over it. Readers
/// that still map the old file keep seeing the old inode.
#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    config: Config,
    locks: LockManager,
    in_memory: bool,
}

impl IndexFile {
    /// Opens the index file at `path`. A missing file is not an error:
    /// [`IndexFile::read_map`] then returns `None`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file exists but cannot be opened.
    pub fn open(path: &Path, config: &Config) -> CoreResult<Self> {
        let file = open_existing(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            config: config.clone(),
            locks: LockManager::new(path, file, config.lock_method),
            in_memory: false,
        })
    }

    /// Creates a handle for an index that is never written to disk.
    #[must_use]
    pub fn in_memory(path: &Path, config: &Config) -> Self {
        Self {
            path: path.to_path_buf(),
            config: config.clone(),
            locks: LockManager::new(path, None, config.lock_method),
            in_memory: true,
        }
    }

    /// Returns the index file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the file exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.locks.file().is_some()
    }

    /// Returns the lock manager.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Returns the lock manager for locking.
    pub fn locks_mut(&mut self) -> &mut LockManager {
        &mut self.locks
    }

    /// Reads the current file into a map, or returns `None` if there is no
    /// file.
    ///
    /// A file replaced by another process since it was opened is reopened
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the shared lock is not granted in time,
    /// `IndexCorrupted` if the file fails validation, or an I/O error.
    pub fn read_map(
        &mut self,
        registry: &Arc<Registry>,
        known_keywords: &[KeywordId],
    ) -> CoreResult<Option<IndexMap>> {
        if self.in_memory {
            return Ok(None);
        }
        self.reopen_if_replaced()?;
        if !self.exists() {
            return Ok(None);
        }

        let id = self.locks.lock_shared(self.config.lock_timeout)?;
        let result = self
            .locks
            .file()
            .map(|file| {
                open_index_bytes(file, self.config.access)
                    .map_err(Into::into)
                    .and_then(|bytes| {
                        IndexMap::from_bytes(&self.path, bytes, Arc::clone(registry), known_keywords)
                    })
            })
            .transpose();
        self.locks.unlock(id);
        let Some(map) = result? else {
            return Ok(None);
        };
        tracing::debug!(
            path = %self.path.display(),
            messages = map.messages_count(),
            log_file_seq = map.header().log_file_seq,
            "read index"
        );
        Ok(Some(map))
    }

    /// Writes `map` to disk.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the dotlock cannot be taken for a
    /// recreation, or an I/O error.
    pub fn write_map(&mut self, map: &IndexMap) -> CoreResult<()> {
        if self.in_memory {
            return Ok(());
        }
        let data = map.encode();
        if self.config.access == AccessStrategy::Read && self.exists() {
            match self.locks.try_lock_exclusive(self.config.lock_timeout) {
                Ok(id) => {
                    let result = self.write_in_place(&data);
                    self.locks.unlock(id);
                    return result;
                }
                Err(err) if err.is_would_block() => {
                    tracing::debug!(path = %self.path.display(), "index is locked, recreating");
                }
                Err(err) => return Err(err),
            }
        }
        self.recreate(&data)
    }

    fn write_in_place(&self, data: &[u8]) -> CoreResult<()> {
        let Some(mut file) = self.locks.file() else {
            return Ok(());
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(data)?;
        file.set_len(data.len() as u64)?;
        if self.config.fsync_mode == FsyncMode::Always {
            file.sync_all()?;
        }
        tracing::debug!(path = %self.path.display(), size = data.len(), "rewrote index in place");
        Ok(())
    }

    fn recreate(&mut self, data: &[u8]) -> CoreResult<()> {
        let mut lock = DotLock::acquire(
            &self.path,
            self.config.lock_timeout,
            self.config.dotlock_stale_timeout,
        )?;
        lock.write_contents(data)?;
        lock.replace()?;
        if self.config.fsync_mode != FsyncMode::Never {
            sync_parent_directory(&self.path)?;
        }
        self.locks.reopen(open_existing(&self.path)?);
        tracing::debug!(path = %self.path.display(), size = data.len(), "recreated index");
        Ok(())
    }

    fn reopen_if_replaced(&mut self) -> CoreResult<()> {
        let current = match self.locks.file() {
            Some(file) => {
                let open = same_file::Handle::from_file(file.try_clone()?)?;
                match same_file::Handle::from_path(&self.path) {
                    Ok(on_disk) => on_disk == open,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => false,
                    Err(err) => return Err(err.into()),
                }
            }
            None => false,
        };
        if !current {
            let file = open_existing(&self.path)?;
            if file.is_some() || self.exists() {
                self.locks.reopen(file);
            }
        }
        Ok(())
    }
}

fn open_existing(path: &Path) -> CoreResult<Option<File>> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(unix)]
fn sync_parent_directory(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_directory(_path: &Path) -> CoreResult<()> {
    Ok(())
}
