//! The transaction log: an arena of log files shared by views and writers.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::lock::FileLock;
use crate::log::file::LogFile;
use crate::log::format::LogFileHeader;
use crate::types::{unix_now, Modseq};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A position in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition {
    /// File sequence number.
    pub file_seq: u32,
    /// Byte offset within the file.
    pub offset: u64,
}

impl LogPosition {
    /// Creates a position.
    #[must_use]
    pub const fn new(file_seq: u32, offset: u64) -> Self {
        Self { file_seq, offset }
    }
}

/// How many times a log lock is retried when the head is rotated between
/// opening and locking it.
const LOCK_ROTATE_RETRIES: usize = 10;

/// The shared state behind a [`TransactionLog`].
#[derive(Debug)]
pub(crate) struct LogInner {
    pub(crate) head_path: PathBuf,
    old_path: PathBuf,
    pub(crate) config: Config,
    /// The log never touches disk.
    memory_only: bool,
    /// Every loaded file, keyed by file sequence.
    pub(crate) files: BTreeMap<u32, LogFile>,
    pub(crate) head_seq: u32,
    lock: Option<FileLock>,
    locked: bool,
}

/// Handle to a mailbox's transaction log.
///
/// Cloning the handle is cheap; all clones share the same files. Views hold
/// a clone and pin the files they read from.
///
/// # Thread Safety
///
/// The file arena is behind a single mutex. Writers additionally take the
/// on-disk log lock so that appends from other processes are serialized.
#[derive(Debug, Clone)]
pub struct TransactionLog {
    inner: Arc<Mutex<LogInner>>,
}

impl TransactionLog {
    /// Opens the log whose head file is at `path`.
    ///
    /// Returns `None` if the head file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `LogCorrupted` if the head file's header is invalid, or an I/O
    /// error.
    pub fn open(path: &Path, config: &Config) -> CoreResult<Option<Self>> {
        let Some(head) = LogFile::open(path)? else {
            return Ok(None);
        };
        Ok(Some(Self::from_head(path, config, head, false)))
    }

    /// Creates a new head file at `path`, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn create(path: &Path, config: &Config, hdr: LogFileHeader) -> CoreResult<Self> {
        let (head, _) = LogFile::create(path, hdr, None, false)?;
        tracing::info!(path = %path.display(), file_seq = hdr.file_seq, "created transaction log");
        Ok(Self::from_head(path, config, head, false))
    }

    /// Creates a log that only lives in process memory.
    #[must_use]
    pub fn in_memory(path: &Path, config: &Config, hdr: LogFileHeader) -> Self {
        let head = LogFile::in_memory(path, hdr);
        Self::from_head(path, config, head, true)
    }

    fn from_head(path: &Path, config: &Config, head: LogFile, memory_only: bool) -> Self {
        let mut old_name = path.as_os_str().to_os_string();
        old_name.push(".2");
        let head_seq = head.file_seq();
        let mut files = BTreeMap::new();
        files.insert(head_seq, head);
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                head_path: path.to_path_buf(),
                old_path: PathBuf::from(old_name),
                config: config.clone(),
                memory_only,
                files,
                head_seq,
                lock: None,
                locked: false,
            })),
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock()
    }

    /// Returns the path of the head file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.inner.lock().head_path.clone()
    }

    /// Returns the header of the head file.
    #[must_use]
    pub fn head_hdr(&self) -> LogFileHeader {
        self.inner.lock().head().hdr
    }

    /// Returns the position after the last durable record.
    #[must_use]
    pub fn head_position(&self) -> LogPosition {
        let inner = self.inner.lock();
        let head = inner.head();
        LogPosition::new(head.file_seq(), head.sync_offset)
    }

    /// Returns the modseq at the head position.
    #[must_use]
    pub fn highest_modseq(&self) -> Modseq {
        self.inner.lock().head().highest_modseq
    }

    /// Returns true if the head file is held in memory, either by request
    /// or after a write failure.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.inner.lock().head().is_in_memory()
    }

    /// Returns the loaded file sequences, oldest first.
    #[must_use]
    pub fn file_seqs(&self) -> Vec<u32> {
        self.inner.lock().files.keys().copied().collect()
    }

    /// Picks up records other processes appended and follows rotations.
    ///
    /// Returns true if the head file changed.
    ///
    /// # Errors
    ///
    /// Returns `LogCorrupted` if the new head is invalid, or an I/O error.
    pub fn refresh(&self) -> CoreResult<bool> {
        self.inner.lock().refresh()
    }

    /// Returns true if the head file is due for rotation.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the head's size cannot be read.
    pub fn need_rotate(&self) -> CoreResult<bool> {
        self.inner.lock().need_rotate()
    }

    /// Starts a new head file.
    ///
    /// With `reset` the new file does not link to the current head: views
    /// spanning the rotation see the index reset. The log must be locked.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the log is not locked, or an I/O error.
    pub fn rotate(&self, reset: bool) -> CoreResult<()> {
        self.inner.lock().rotate(reset)
    }

    /// Locks the log for writing, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if already locked, `LockTimeout`, or an
    /// I/O error.
    pub fn lock(&self) -> CoreResult<()> {
        self.inner.lock().lock()
    }

    /// Releases the log lock.
    pub fn unlock(&self) {
        self.inner.lock().unlock();
    }

    /// Returns true while the log lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    /// Records that an index has absorbed the head file up to `offset`.
    ///
    /// The next append writes the offset into the log so that other
    /// processes can tell how far the log has been applied.
    pub fn set_max_tail_offset(&self, file_seq: u32, offset: u64) {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.files.get_mut(&file_seq) {
            let offset = u32::try_from(offset).unwrap_or(u32::MAX);
            file.max_tail_offset = file.max_tail_offset.max(offset);
        }
    }

    /// Drops unreferenced files older than `min_file_seq`.
    pub fn free_unused(&self, min_file_seq: u32) {
        let mut inner = self.inner.lock();
        let head_seq = inner.head_seq;
        inner.files.retain(|&seq, file| {
            let keep = seq == head_seq || seq >= min_file_seq || file.refcount > 0;
            if !keep {
                tracing::debug!(file_seq = seq, "freeing unused log file");
            }
            keep
        });
    }

    #[cfg(test)]
    pub(crate) fn replace_head_backend(&self, backend: Box<dyn mailindex_storage::StorageBackend>) {
        let mut inner = self.inner.lock();
        let head_seq = inner.head_seq;
        if let Some(head) = inner.files.get_mut(&head_seq) {
            head.replace_backend(backend);
        }
    }
}

impl LogInner {
    pub(crate) fn head(&self) -> &LogFile {
        &self.files[&self.head_seq]
    }

    pub(crate) fn head_mut(&mut self) -> &mut LogFile {
        self.files
            .get_mut(&self.head_seq)
            .unwrap_or_else(|| unreachable!("head file is always loaded"))
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked
    }

    /// Returns the file with `seq`, loading the rotated-out file from disk
    /// if that is the one asked for.
    pub(crate) fn load_file(&mut self, seq: u32) -> CoreResult<Option<&mut LogFile>> {
        if !self.files.contains_key(&seq) && !self.memory_only {
            if let Some(old) = LogFile::open(&self.old_path)? {
                if old.file_seq() == seq {
                    tracing::debug!(file_seq = seq, "loaded rotated log file");
                    self.files.insert(seq, old);
                }
            }
        }
        Ok(self.files.get_mut(&seq))
    }

    pub(crate) fn refresh(&mut self) -> CoreResult<bool> {
        if self.memory_only || self.head().is_in_memory() {
            return Ok(false);
        }
        let mut changed = false;
        if !self.head().is_current_at(&self.head_path)? {
            match LogFile::open(&self.head_path)? {
                Some(new_head) if new_head.file_seq() >= self.head_seq => {
                    let seq = new_head.file_seq();
                    if seq != self.head_seq {
                        let old_path = self.old_path.clone();
                        self.head_mut().path = old_path;
                    }
                    tracing::debug!(old_seq = self.head_seq, new_seq = seq, "log head changed");
                    self.files.insert(seq, new_head);
                    self.head_seq = seq;
                    changed = true;
                }
                Some(new_head) => {
                    return Err(CoreError::log_corrupted(
                        &self.head_path,
                        0,
                        0,
                        format!(
                            "file_seq went backwards: {} < {}",
                            new_head.file_seq(),
                            self.head_seq
                        ),
                    ));
                }
                None => {
                    tracing::warn!(path = %self.head_path.display(), "log head disappeared");
                    return Ok(false);
                }
            }
        }
        self.head_mut().read_new()?;
        Ok(changed)
    }

    pub(crate) fn need_rotate(&self) -> CoreResult<bool> {
        let head = self.head();
        let size = head.size()?;
        let config = &self.config;
        if size >= config.log_rotate_max_size {
            return Ok(true);
        }
        let age = u64::from(unix_now().saturating_sub(head.hdr.create_stamp));
        Ok(size >= config.log_rotate_min_size && age >= config.log_rotate_min_age.as_secs())
    }

    pub(crate) fn rotate(&mut self, reset: bool) -> CoreResult<()> {
        if !self.locked {
            return Err(CoreError::invalid_operation("log must be locked to rotate"));
        }
        let head = self.head();
        let (prev_seq, prev_offset) = if reset {
            (0, 0)
        } else {
            (head.file_seq(), head.sync_offset)
        };
        let mut hdr = LogFileHeader::new(head.hdr.indexid, head.file_seq() + 1, prev_seq, prev_offset);
        hdr.initial_modseq = head.highest_modseq;

        let new_head = if self.memory_only || head.is_in_memory() {
            LogFile::in_memory(&self.head_path, hdr)
        } else {
            let relock = matches!(self.lock, Some(FileLock::Flock { .. }));
            let (file, lock) = LogFile::create(&self.head_path, hdr, Some(&self.old_path), relock)?;
            if relock {
                self.lock = lock;
            }
            let old_path = self.old_path.clone();
            self.head_mut().path = old_path;
            file
        };
        tracing::info!(file_seq = hdr.file_seq, prev_file_seq = prev_seq, reset, "rotated transaction log");
        self.files.insert(hdr.file_seq, new_head);
        self.head_seq = hdr.file_seq;
        Ok(())
    }

    pub(crate) fn lock(&mut self) -> CoreResult<()> {
        if self.locked {
            return Err(CoreError::invalid_operation("transaction log is already locked"));
        }
        if self.memory_only || self.head().is_in_memory() {
            self.locked = true;
            return Ok(());
        }
        for _ in 0..LOCK_ROTATE_RETRIES {
            let lock = FileLock::acquire(
                &self.head_path,
                self.config.lock_method,
                self.config.lock_timeout,
                self.config.dotlock_stale_timeout,
            )?;
            if self.lock_is_on_head(&lock)? {
                self.lock = Some(lock);
                self.locked = true;
                self.refresh()?;
                return Ok(());
            }
            tracing::debug!(path = %self.head_path.display(), "log rotated while locking, retrying");
        }
        Err(CoreError::LockTimeout {
            path: self.head_path.clone(),
        })
    }

    fn lock_is_on_head(&self, lock: &FileLock) -> CoreResult<bool> {
        match lock {
            // The dotlock is taken by name, so it covers whatever file is
            // the head.
            FileLock::Dot(_) => Ok(true),
            FileLock::Flock { file, .. } => {
                let locked = same_file::Handle::from_file(file.try_clone()?)?;
                match same_file::Handle::from_path(&self.head_path) {
                    Ok(head) => Ok(head == locked),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    pub(crate) fn unlock(&mut self) {
        self.lock = None;
        self.locked = false;
    }
}
