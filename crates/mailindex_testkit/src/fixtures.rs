//! Test fixtures and index helpers.
//!
//! Provides temporary index directories, pre-populated indexes and small
//! helpers for the transactions most tests start with.

use mailindex_core::types::Uid;
use mailindex_core::{
    CommitResult, Config, MailFlags, MailIndex, ModifyType, Registry, Transaction,
    TransactionFlags,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;

static INIT_LOGGING: Once = Once::new();

/// Routes `tracing` output to the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs the
/// subscriber.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A test index with automatic cleanup.
pub struct TestIndex {
    /// The index handle.
    pub index: MailIndex,
    /// Registry shared by every handle opened on this index.
    pub registry: Arc<Registry>,
    config: Config,
    /// The temporary directory (kept alive to prevent cleanup).
    dir: Option<TempDir>,
}

impl TestIndex {
    /// Creates a new in-memory test index.
    pub fn memory() -> Self {
        init_test_logging();
        let registry = Registry::new();
        Self {
            index: MailIndex::open_in_memory(Arc::clone(&registry)),
            registry,
            config: Config::default(),
            dir: None,
        }
    }

    /// Creates a new index in a temporary directory.
    pub fn file() -> Self {
        Self::file_with(Config::default())
    }

    /// Creates a new index in a temporary directory with `config`.
    pub fn file_with(config: Config) -> Self {
        init_test_logging();
        let dir = TempDir::new().expect("Failed to create temp directory");
        let registry = Registry::new();
        let index = MailIndex::open(dir.path(), &config, Arc::clone(&registry))
            .expect("Failed to open file index");
        Self {
            index,
            registry,
            config,
            dir: Some(dir),
        }
    }

    /// Returns the index directory if file-based, None if in-memory.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// Returns the index file path if file-based.
    pub fn index_path(&self) -> Option<PathBuf> {
        self.dir().map(|dir| dir.join(&self.config.prefix))
    }

    /// Returns the log head file path if file-based.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.dir()
            .map(|dir| dir.join(format!("{}.log", self.config.prefix)))
    }

    /// Opens another handle on the same files, as a second process would.
    pub fn open_another(&self) -> MailIndex {
        let dir = self.dir().expect("Only file indexes can be shared");
        MailIndex::open(dir, &self.config, Arc::clone(&self.registry))
            .expect("Failed to open second handle")
    }

    /// Closes the index and opens it again from disk.
    pub fn reopen(&mut self) {
        let dir = self.dir().expect("Only file indexes can be reopened");
        let index = MailIndex::open(dir, &self.config, Arc::clone(&self.registry))
            .expect("Failed to reopen index");
        self.index = index;
    }
}

impl std::ops::Deref for TestIndex {
    type Target = MailIndex;

    fn deref(&self) -> &Self::Target {
        &self.index
    }
}

/// Runs a test with a temporary in-memory index.
///
/// # Example
///
/// ```rust
/// use mailindex_testkit::with_temp_index;
///
/// with_temp_index(|index| {
///     assert_eq!(index.map().messages_count(), 0);
/// });
/// ```
pub fn with_temp_index<F, R>(f: F) -> R
where
    F: FnOnce(&MailIndex) -> R,
{
    let test_index = TestIndex::memory();
    f(&test_index.index)
}

/// Runs a test with an index in a temporary directory.
pub fn with_file_index<F, R>(f: F) -> R
where
    F: FnOnce(&MailIndex, &Path) -> R,
{
    let test_index = TestIndex::file();
    let dir = test_index.dir().expect("File index should have a directory");
    f(&test_index.index, dir)
}

/// Appends `count` messages in one transaction and returns their UIDs.
pub fn append_messages(index: &MailIndex, count: u32) -> Option<(Uid, Uid)> {
    let mut tx = index.transaction_begin(TransactionFlags::empty());
    for _ in 0..count {
        tx.append(0);
    }
    commit(index, tx).uids
}

/// Changes `flags` on `seq1..=seq2` in one transaction.
pub fn modify_flags(index: &MailIndex, seq1: u32, seq2: u32, mode: ModifyType, flags: MailFlags) {
    let mut tx = index.transaction_begin(TransactionFlags::empty());
    tx.update_flags(seq1, seq2, mode, flags);
    commit(index, tx);
}

/// Expunges `seq1..=seq2` in one transaction.
pub fn expunge_range(index: &MailIndex, seq1: u32, seq2: u32) {
    let mut tx = index.transaction_begin(TransactionFlags::empty());
    for seq in seq1..=seq2 {
        tx.expunge(seq, [0; 16]);
    }
    commit(index, tx);
}

fn commit(index: &MailIndex, tx: Transaction) -> CommitResult {
    index.commit(tx).expect("Failed to commit transaction")
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates an in-memory index holding `count` messages.
    pub fn populated_index(count: u32) -> TestIndex {
        let test_index = TestIndex::memory();
        if count > 0 {
            append_messages(&test_index, count);
        }
        test_index
    }

    /// Creates a file index holding `count` messages, the first `seen` of
    /// them marked `\Seen`.
    pub fn populated_file_index(count: u32, seen: u32) -> TestIndex {
        let test_index = TestIndex::file();
        if count > 0 {
            append_messages(&test_index, count);
        }
        if seen > 0 {
            modify_flags(&test_index, 1, seen, ModifyType::Add, MailFlags::SEEN);
        }
        test_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_index() {
        let test_index = TestIndex::memory();
        assert!(test_index.dir().is_none());
        assert_eq!(test_index.map().messages_count(), 0);
    }

    #[test]
    fn test_file_index_paths() {
        let test_index = TestIndex::file();
        assert!(test_index.index_path().unwrap().exists());
        assert!(test_index.log_path().unwrap().exists());
    }

    #[test]
    fn test_with_file_index() {
        with_file_index(|index, dir| {
            assert!(dir.is_dir());
            assert_eq!(append_messages(index, 2), Some((1, 2)));
        });
    }

    #[test]
    fn test_populated_scenario() {
        let test_index = scenarios::populated_file_index(5, 3);
        let hdr = test_index.map().header().clone();
        assert_eq!(hdr.messages_count, 5);
        assert_eq!(hdr.seen_messages_count, 3);
        assert!(hdr.first_unseen_uid_lowwater <= 4);
    }

    #[test]
    fn test_reopen_keeps_messages() {
        let mut test_index = scenarios::populated_file_index(4, 0);
        test_index.reopen();
        assert_eq!(test_index.map().messages_count(), 4);
    }
}
