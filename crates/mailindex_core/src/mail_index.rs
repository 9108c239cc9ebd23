//! The mailbox index facade.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::index::{ConsistencyLevel, HeaderFlags, IndexFile, IndexMap};
use crate::lock::LockId;
use crate::log::{LogAppend, LogFileHeader, LogPosition, LogSpan, LogView, RecordType, TransactionLog};
use crate::registry::Registry;
use crate::sync::replay;
use crate::transaction::{export, Transaction, TransactionFlags};
use crate::types::{unix_now, Uid};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Outcome of [`MailIndex::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    /// Where the transaction landed in the log. Empty for a transaction
    /// with no changes.
    pub span: LogSpan,
    /// UIDs given to the appended messages, if any.
    pub uids: Option<(Uid, Uid)>,
}

/// An open mailbox index: the index file, its transaction log and the
/// current map.
///
/// Changes are made through transactions. Committing appends one
/// transaction to the log and replays it into a new map; the index file
/// is rewritten when the map has moved far enough past it. Other handles
/// on the same files see the change on their next [`MailIndex::refresh`].
///
/// # Recovery
///
/// An index file that fails validation, or that belongs to another log,
/// is rebuilt from the oldest log records still present. If the log no
/// longer reaches back to its beginning the rebuilt header carries
/// `FSCKD`. A missing log is recreated and continues from the index.
///
/// # Example
///
/// ```rust
/// use mailindex_core::{Config, MailIndex, Registry, TransactionFlags};
///
/// let dir = tempfile::tempdir().unwrap();
/// let index = MailIndex::open(dir.path(), &Config::default(), Registry::new()).unwrap();
///
/// let mut tx = index.transaction_begin(TransactionFlags::empty());
/// tx.append(0);
/// let result = index.commit(tx).unwrap();
/// assert_eq!(result.uids, Some((1, 1)));
/// assert_eq!(index.map().messages_count(), 1);
/// ```
#[derive(Debug)]
pub struct MailIndex {
    config: Config,
    registry: Arc<Registry>,
    file: Mutex<IndexFile>,
    log: TransactionLog,
    map: RwLock<Arc<IndexMap>>,
    /// Log position of the index file as last read or written; `None`
    /// until the file holds a usable map.
    written: Mutex<Option<LogPosition>>,
    /// Serializes commits and refreshes: the log lock is per process.
    sync_lock: Mutex<()>,
}

impl MailIndex {
    /// Opens the index named by `config.prefix` in `dir`.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if nothing exists and `create_if_missing` is off
    /// - `LogCorrupted` if the log cannot be replayed
    /// - `LockTimeout` or an I/O error from the files
    pub fn open(dir: &Path, config: &Config, registry: Arc<Registry>) -> CoreResult<Self> {
        if !dir.is_dir() {
            if !config.create_if_missing {
                return Err(CoreError::invalid_operation(format!(
                    "index directory {} does not exist",
                    dir.display()
                )));
            }
            fs::create_dir_all(dir)?;
        }
        let index_path = dir.join(&config.prefix);
        let log_path = dir.join(format!("{}.log", config.prefix));

        let mut file = IndexFile::open(&index_path, config)?;
        let stored = match file.read_map(&registry, &[]) {
            Ok(map) => map,
            Err(err) if err.is_corruption() => {
                tracing::warn!(%err, "index file is unusable, rebuilding from the log");
                None
            }
            Err(err) => return Err(err),
        };
        let written = stored.as_ref().map(map_position);

        let (log, created) = match TransactionLog::open(&log_path, config)? {
            Some(log) => (log, false),
            None if stored.is_none() && !config.create_if_missing => {
                return Err(CoreError::invalid_operation(format!(
                    "no index at {}",
                    index_path.display()
                )));
            }
            None => {
                // A recreated log continues right after the index's file.
                let (indexid, file_seq) = stored.as_ref().map_or((unix_now().max(1), 1), |map| {
                    (map.header().indexid, map.header().log_file_seq + 1)
                });
                let hdr = LogFileHeader::new(indexid, file_seq, 0, 0);
                (TransactionLog::create(&log_path, config, hdr)?, true)
            }
        };

        let head = log.head_hdr();
        let map = match stored.and_then(|map| checked(map, head.indexid)) {
            Some(map) if created => positioned(map, log.head_position()),
            Some(map) => map,
            None if created => positioned(
                IndexMap::new_empty(&index_path, head.indexid, Arc::clone(&registry)),
                log.head_position(),
            ),
            None => rebuild(&log, &index_path, &registry)?,
        };

        let index = Self {
            config: config.clone(),
            registry,
            file: Mutex::new(file),
            log,
            map: RwLock::new(Arc::new(map)),
            written: Mutex::new(written),
            sync_lock: Mutex::new(()),
        };
        if !index.refresh()? {
            index.write_if_due(&index.map());
        }
        tracing::info!(
            path = %index_path.display(),
            indexid = head.indexid,
            messages = index.map().messages_count(),
            "opened mail index"
        );
        Ok(index)
    }

    /// Creates an index that lives only in memory.
    #[must_use]
    pub fn open_in_memory(registry: Arc<Registry>) -> Self {
        let config = Config::default();
        let index_path = Path::new("(in-memory)");
        let indexid = unix_now().max(1);
        let log = TransactionLog::in_memory(
            &index_path.with_extension("log"),
            &config,
            LogFileHeader::new(indexid, 1, 0, 0),
        );
        let map = positioned(
            IndexMap::new_empty(index_path, indexid, Arc::clone(&registry)),
            log.head_position(),
        );
        Self {
            file: Mutex::new(IndexFile::in_memory(index_path, &config)),
            config,
            registry,
            log,
            map: RwLock::new(Arc::new(map)),
            written: Mutex::new(None),
            sync_lock: Mutex::new(()),
        }
    }

    /// Returns the configuration the index was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the extension and keyword registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the transaction log.
    #[must_use]
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Returns the current map.
    #[must_use]
    pub fn map(&self) -> Arc<IndexMap> {
        Arc::clone(&self.map.read())
    }

    /// Picks up transactions committed by other handles.
    ///
    /// Returns true if the map changed.
    ///
    /// # Errors
    ///
    /// Returns `LogCorrupted` if the new records cannot be replayed, or an
    /// I/O error.
    pub fn refresh(&self) -> CoreResult<bool> {
        let _guard = self.sync_lock.lock();
        self.log.refresh()?;
        let base = self.map();
        let Some(map) = self.sync_or_recover(&base)? else {
            return Ok(false);
        };
        self.install(map);
        Ok(true)
    }

    /// Starts a transaction on the current map.
    #[must_use]
    pub fn transaction_begin(&self, flags: TransactionFlags) -> Transaction {
        Transaction::new(self.map(), flags)
    }

    /// Commits `tx`: appends it to the log and replays it into the map.
    ///
    /// New messages get UIDs from the map as it is when the log lock is
    /// taken, so commits racing from other processes never hand out the
    /// same UID twice.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the log lock is not granted, `LogCorrupted`
    /// if the log cannot be replayed, or an I/O error.
    pub fn commit(&self, tx: Transaction) -> CoreResult<CommitResult> {
        if tx.is_empty() {
            let pos = self.log.head_position();
            return Ok(CommitResult {
                span: LogSpan { start: pos, end: pos },
                uids: None,
            });
        }

        let _guard = self.sync_lock.lock();
        let mut record_flags = RecordType::empty();
        if tx.flags().contains(TransactionFlags::EXTERNAL) {
            record_flags |= RecordType::EXTERNAL;
        }
        if tx.flags().contains(TransactionFlags::SYNC) {
            record_flags |= RecordType::SYNC;
        }

        let mut append = LogAppend::begin(&self.log, record_flags)?;
        if tx.flags().contains(TransactionFlags::FSYNC) {
            append.request_fsync();
        }
        let base = self.map();
        let current = match self.sync_or_recover(&base)? {
            Some(map) => Arc::new(map),
            None => base,
        };
        let uids = export(&tx, &current, &mut append);
        let span = append.commit()?;

        let map = sync_map(&self.log, &current)?
            .unwrap_or_else(|| IndexMap::clone(&current));
        self.install(map);
        tracing::debug!(
            file_seq = span.end.file_seq,
            offset = span.end.offset,
            appended = tx.append_count(),
            "committed transaction"
        );
        Ok(CommitResult { span, uids })
    }

    /// Writes the current map to the index file.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the file cannot be locked for rewriting, or
    /// an I/O error.
    pub fn write_index(&self) -> CoreResult<()> {
        let map = self.map();
        self.write_map(&map)
    }

    /// Opens an unbounded view on the log.
    #[must_use]
    pub fn log_view(&self) -> LogView {
        LogView::open(&self.log)
    }

    /// Takes a shared lock on the index file.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` or an I/O error.
    pub fn lock_shared(&self) -> CoreResult<LockId> {
        self.file.lock().locks_mut().lock_shared(self.config.lock_timeout)
    }

    /// Tries once to take an exclusive lock on the index file.
    ///
    /// # Errors
    ///
    /// Returns `LockWouldBlock` if another process holds a lock, or an I/O
    /// error.
    pub fn try_lock_exclusive(&self) -> CoreResult<LockId> {
        self.file
            .lock()
            .locks_mut()
            .try_lock_exclusive(self.config.lock_timeout)
    }

    /// Releases an index file lock.
    pub fn unlock(&self, id: LockId) {
        self.file.lock().locks_mut().unlock(id);
    }

    /// Returns true if `id` is still a held index file lock.
    #[must_use]
    pub fn is_lock_valid(&self, id: LockId) -> bool {
        self.file.lock().locks().is_valid(id)
    }

    fn install(&self, map: IndexMap) {
        self.write_if_due(&map);
        *self.map.write() = Arc::new(map);
    }

    /// Index writes are best effort: the log already holds every change.
    fn write_if_due(&self, map: &IndexMap) {
        if let Err(err) = self.maybe_write(map) {
            tracing::warn!(path = %map.path().display(), %err, "failed to write index file");
        }
    }

    /// Writes `map` once it has moved to a new log file, or further than the
    /// write threshold within one.
    fn maybe_write(&self, map: &IndexMap) -> CoreResult<()> {
        let pos = map_position(map);
        let due = match *self.written.lock() {
            None => true,
            Some(written) => {
                written.file_seq != pos.file_seq
                    || pos.offset.saturating_sub(written.offset) > self.config.index_write_threshold
            }
        };
        if due {
            self.write_map(map)?;
        }
        Ok(())
    }

    fn write_map(&self, map: &IndexMap) -> CoreResult<()> {
        self.file.lock().write_map(map)?;
        let pos = map_position(map);
        self.log.set_max_tail_offset(pos.file_seq, pos.offset);
        self.log.free_unused(pos.file_seq);
        *self.written.lock() = Some(pos);
        Ok(())
    }

    /// Brings `base` up to the log head. When the log no longer reaches back
    /// to `base`, the index file is reread in case another process wrote a
    /// newer one, and the map is rebuilt from the log if that fails too.
    fn sync_or_recover(&self, base: &IndexMap) -> CoreResult<Option<IndexMap>> {
        let err = match sync_map(&self.log, base) {
            Err(err) if err.is_history_lost() => err,
            other => return other,
        };
        tracing::warn!(path = %base.path().display(), %err, "log no longer covers the map, reloading");

        let indexid = self.log.head_hdr().indexid;
        let stored = match self.file.lock().read_map(&self.registry, base.keywords()) {
            Ok(map) => map.and_then(|map| checked(map, indexid)),
            Err(err) if err.is_corruption() => None,
            Err(err) => return Err(err),
        };
        if let Some(stored) = stored {
            match sync_map(&self.log, &stored) {
                Ok(map) => return Ok(Some(map.unwrap_or(stored))),
                Err(err) if err.is_history_lost() => {}
                Err(err) => return Err(err),
            }
        }
        rebuild(&self.log, base.path(), &self.registry).map(Some)
    }
}

/// Where in the log `map` ends.
fn map_position(map: &IndexMap) -> LogPosition {
    let hdr = map.header();
    LogPosition::new(hdr.log_file_seq, u64::from(hdr.log_file_head_offset))
}

/// Moves a map to `pos` without replaying anything.
fn positioned(mut map: IndexMap, pos: LogPosition) -> IndexMap {
    let offset = u32::try_from(pos.offset).unwrap_or(u32::MAX);
    let hdr = map.hdr_mut();
    hdr.log_file_seq = pos.file_seq;
    hdr.log_file_head_offset = offset;
    hdr.log_file_tail_offset = offset;
    map
}

/// Returns `map` if it can be used with the log `indexid`, applying upgrade
/// fixups on the way.
fn checked(mut map: IndexMap, indexid: u32) -> Option<IndexMap> {
    let path = map.path().display().to_string();
    if map.header().indexid != indexid {
        tracing::warn!(
            %path,
            index = map.header().indexid,
            log = indexid,
            "index belongs to another log, rebuilding"
        );
        return None;
    }
    if map.header().flags.contains(HeaderFlags::CORRUPTED) {
        tracing::warn!(%path, "index is marked corrupted, rebuilding");
        return None;
    }
    match map.check_header() {
        ConsistencyLevel::Consistent => Some(map),
        ConsistencyLevel::NeedsUpgradeFixups => {
            map.apply_upgrade_fixups();
            Some(map)
        }
        ConsistencyLevel::NeedsRebuild(reason) => {
            tracing::warn!(%path, %reason, "index header is inconsistent, rebuilding");
            None
        }
    }
}

/// Replays everything after `base` up to the log head.
///
/// Returns `None` if `base` is already at the head.
fn sync_map(log: &TransactionLog, base: &IndexMap) -> CoreResult<Option<IndexMap>> {
    let head = log.head_position();
    let from = map_position(base);
    if from == head {
        return Ok(None);
    }
    let mut view = LogView::open(log);
    view.set_bounds(from, LogPosition::new(head.file_seq, u64::MAX))?;
    replay(base, &mut view).map(Some)
}

/// Builds a map from the oldest log records still present.
fn rebuild(log: &TransactionLog, path: &Path, registry: &Arc<Registry>) -> CoreResult<IndexMap> {
    let head = log.head_hdr();
    let mut view = LogView::open(log);
    let complete = view.set_bounds_from_oldest(LogPosition::new(head.file_seq, u64::MAX))?;
    let empty = IndexMap::new_empty(path, head.indexid, Arc::clone(registry));
    let mut map = replay(&empty, &mut view)?;
    if !complete {
        tracing::warn!(
            path = %path.display(),
            oldest_file_seq = view.file_seqs().first().copied().unwrap_or(0),
            "log history is incomplete, rebuilt index may miss messages"
        );
        map.hdr_mut().flags |= HeaderFlags::FSCKD;
    }
    tracing::info!(path = %path.display(), messages = map.messages_count(), "rebuilt index from log");
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MailFlags, ModifyType};
    use std::time::Duration;
    use tempfile::tempdir;

    fn open(dir: &Path) -> MailIndex {
        MailIndex::open(dir, &Config::default(), Registry::new()).unwrap()
    }

    fn append(index: &MailIndex, count: u32) -> CommitResult {
        let mut tx = index.transaction_begin(TransactionFlags::empty());
        for _ in 0..count {
            tx.append(0);
        }
        index.commit(tx).unwrap()
    }

    #[test]
    fn open_creates_index_and_log() {
        let dir = tempdir().unwrap();
        let index = open(dir.path());
        assert!(dir.path().join("mailindex").exists());
        assert!(dir.path().join("mailindex.log").exists());
        assert_eq!(index.map().messages_count(), 0);
        assert_eq!(index.map().header().indexid, index.log().head_hdr().indexid);
    }

    #[test]
    fn missing_directory_without_create_fails() {
        let dir = tempdir().unwrap();
        let config = Config::default().create_if_missing(false);
        let err = MailIndex::open(&dir.path().join("nope"), &config, Registry::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn commits_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let index = open(dir.path());
            assert_eq!(append(&index, 3).uids, Some((1, 3)));
            let mut tx = index.transaction_begin(TransactionFlags::empty());
            tx.update_flags(2, 3, ModifyType::Add, MailFlags::SEEN);
            index.commit(tx).unwrap();
        }
        let index = open(dir.path());
        let map = index.map();
        assert_eq!(map.messages_count(), 3);
        assert_eq!(map.header().seen_messages_count, 2);
        assert_ne!(map.header().uid_validity, 0);
        assert_eq!(append(&index, 1).uids, Some((4, 4)));
    }

    #[test]
    fn refresh_sees_other_handles() {
        let dir = tempdir().unwrap();
        let a = open(dir.path());
        let b = open(dir.path());
        append(&a, 2);
        assert_eq!(b.map().messages_count(), 0);
        assert!(b.refresh().unwrap());
        assert_eq!(b.map().messages_count(), 2);
        assert!(!b.refresh().unwrap());

        // b commits on top of what a wrote without refreshing first.
        append(&a, 1);
        assert_eq!(append(&b, 1).uids, Some((4, 4)));
        assert_eq!(b.map().messages_count(), 4);
    }

    #[test]
    fn empty_commit_writes_nothing() {
        let index = MailIndex::open_in_memory(Registry::new());
        let before = index.log().head_position();
        let result = index.commit(index.transaction_begin(TransactionFlags::empty())).unwrap();
        assert_eq!(result.uids, None);
        assert_eq!(result.span.start, before);
        assert_eq!(index.log().head_position(), before);
    }

    #[test]
    fn in_memory_index_commits() {
        let index = MailIndex::open_in_memory(Registry::new());
        append(&index, 5);
        let mut tx = index.transaction_begin(TransactionFlags::EXTERNAL);
        tx.expunge(5, [0; 16]);
        index.commit(tx).unwrap();
        assert_eq!(index.map().messages_count(), 4);
        assert!(index.log().is_in_memory());
    }

    #[test]
    fn corrupted_index_is_rebuilt_from_log() {
        let dir = tempdir().unwrap();
        {
            let index = open(dir.path());
            append(&index, 4);
        }
        fs::write(dir.path().join("mailindex"), b"garbage").unwrap();

        let index = open(dir.path());
        assert_eq!(index.map().messages_count(), 4);
        assert!(!index.map().header().flags.contains(HeaderFlags::FSCKD));
    }

    #[test]
    fn index_of_another_log_is_rebuilt() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        append(&open(a.path()), 2);
        append(&open(b.path()), 1);
        fs::copy(a.path().join("mailindex"), b.path().join("mailindex")).unwrap();

        let index = open(b.path());
        assert_eq!(index.map().messages_count(), 1);
        assert_eq!(index.map().header().indexid, index.log().head_hdr().indexid);
    }

    #[test]
    fn missing_log_continues_from_index() {
        let dir = tempdir().unwrap();
        let seq = {
            let index = open(dir.path());
            append(&index, 2);
            index.map().header().log_file_seq
        };
        fs::remove_file(dir.path().join("mailindex.log")).unwrap();

        let index = open(dir.path());
        assert_eq!(index.map().messages_count(), 2);
        assert_eq!(index.log().head_hdr().file_seq, seq + 1);
        assert_eq!(append(&index, 1).uids, Some((3, 3)));
    }

    #[test]
    fn write_threshold_defers_index_writes() {
        let dir = tempdir().unwrap();
        let config = Config::default().index_write_threshold(1 << 20);
        let index = MailIndex::open(dir.path(), &config, Registry::new()).unwrap();
        let mut tx = index.transaction_begin(TransactionFlags::empty());
        tx.append(0);
        index.commit(tx).unwrap();

        let read = |config: &Config| {
            let mut file = IndexFile::open(&dir.path().join("mailindex"), config).unwrap();
            file.read_map(&Registry::new(), &[]).unwrap().unwrap().messages_count()
        };
        assert_eq!(read(&config), 0);
        index.write_index().unwrap();
        assert_eq!(read(&config), 1);
    }

    #[test]
    fn index_lock_accessors() {
        let dir = tempdir().unwrap();
        let config = Config::default().lock_timeout(Duration::from_secs(1));
        let index = MailIndex::open(dir.path(), &config, Registry::new()).unwrap();
        let shared = index.lock_shared().unwrap();
        assert!(index.is_lock_valid(shared));
        index.unlock(shared);
        assert!(!index.is_lock_valid(shared));

        let excl = index.try_lock_exclusive().unwrap();
        assert!(excl.is_exclusive());
        index.unlock(excl);
    }
}
