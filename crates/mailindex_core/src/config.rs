//! Index configuration.

use crate::lock::LockMethod;
use mailindex_storage::AccessStrategy;
use std::time::Duration;

/// When written data is forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncMode {
    /// Sync after every log append and index write.
    Always,
    /// Sync index recreation, and log appends of transactions that ask
    /// for it with `TransactionFlags::FSYNC`.
    #[default]
    Optimized,
    /// Never sync; rely on the OS.
    Never,
}

/// Configuration for opening a mailbox index.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the index directory and files if missing.
    pub create_if_missing: bool,

    /// File name prefix: the index is `<prefix>`, the log `<prefix>.log`.
    pub prefix: String,

    /// Locking discipline for the index and log files.
    pub lock_method: LockMethod,

    /// How long shared locks (and log locks) are waited for.
    pub lock_timeout: Duration,

    /// Dotlocks older than this are considered abandoned and removed.
    pub dotlock_stale_timeout: Duration,

    /// How the index file is brought into memory.
    pub access: AccessStrategy,

    /// Durability policy.
    pub fsync_mode: FsyncMode,

    /// The files live on NFS: every append is flushed and file identity is
    /// re-checked with stat on refresh.
    pub nfs_flush: bool,

    /// The log is never rotated while smaller than this.
    pub log_rotate_min_size: u64,

    /// The log is always rotated once larger than this.
    pub log_rotate_max_size: u64,

    /// Between min and max size, the log is rotated once its head file is
    /// older than this.
    pub log_rotate_min_age: Duration,

    /// Rewrite the index once this many log bytes exist beyond the point the
    /// index file was written at (0 = only on explicit request).
    pub index_write_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            prefix: "mailindex".to_string(),
            lock_method: LockMethod::Flock,
            lock_timeout: Duration::from_secs(120),
            dotlock_stale_timeout: Duration::from_secs(300),
            access: AccessStrategy::Mmap,
            fsync_mode: FsyncMode::Optimized,
            nfs_flush: false,
            log_rotate_min_size: 32 * 1024,                 // 32 KB
            log_rotate_max_size: 1024 * 1024,               // 1 MB
            log_rotate_min_age: Duration::from_secs(300),   // 5 minutes
            index_write_threshold: 0,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create missing files.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the file name prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the locking discipline.
    #[must_use]
    pub const fn lock_method(mut self, method: LockMethod) -> Self {
        self.lock_method = method;
        self
    }

    /// Sets the shared lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the dotlock stale timeout.
    #[must_use]
    pub const fn dotlock_stale_timeout(mut self, timeout: Duration) -> Self {
        self.dotlock_stale_timeout = timeout;
        self
    }

    /// Sets the index access strategy.
    #[must_use]
    pub const fn access(mut self, access: AccessStrategy) -> Self {
        self.access = access;
        self
    }

    /// Sets the durability policy.
    #[must_use]
    pub const fn fsync_mode(mut self, mode: FsyncMode) -> Self {
        self.fsync_mode = mode;
        self
    }

    /// Enables NFS consistency handling.
    #[must_use]
    pub const fn nfs_flush(mut self, value: bool) -> Self {
        self.nfs_flush = value;
        self
    }

    /// Sets the log rotation thresholds.
    #[must_use]
    pub const fn log_rotate(mut self, min_size: u64, max_size: u64, min_age: Duration) -> Self {
        self.log_rotate_min_size = min_size;
        self.log_rotate_max_size = max_size;
        self.log_rotate_min_age = min_age;
        self
    }

    /// Sets the automatic index rewrite threshold.
    #[must_use]
    pub const fn index_write_threshold(mut self, bytes: u64) -> Self {
        self.index_write_threshold = bytes;
        self
    }

    /// Returns true if a log append must be forced to stable storage.
    /// `requested` is set when the transaction itself asked for a sync.
    #[must_use]
    pub fn sync_log_appends(&self, requested: bool) -> bool {
        self.nfs_flush
            || match self.fsync_mode {
                FsyncMode::Always => true,
                FsyncMode::Optimized => requested,
                FsyncMode::Never => false,
            }
    }
}
