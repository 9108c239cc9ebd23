//! Appending transactions to the log.

use crate::error::{CoreError, CoreResult};
use crate::index::header::offsets;
use crate::log::format::{begin_record, finish_record, RecordKind, RecordType, RECORD_HEADER_SIZE};
use crate::log::records::encode_patch;
use crate::log::transaction_log::{LogInner, LogPosition, TransactionLog};

/// Size of the BOUNDARY record that opens every transaction.
const BOUNDARY_RECORD_SIZE: usize = RECORD_HEADER_SIZE + 4;

/// Where an appended transaction landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSpan {
    /// Position of the transaction's BOUNDARY record.
    pub start: LogPosition,
    /// Position just past the transaction.
    pub end: LogPosition,
}

/// A transaction being framed for the log.
///
/// Records are buffered and written in one go by [`LogAppend::commit`],
/// so other processes see either the whole transaction or none of it.
/// The log lock is taken when the append begins unless the caller already
/// holds it, and is released again when the append ends.
#[derive(Debug)]
pub struct LogAppend {
    log: TransactionLog,
    buf: Vec<u8>,
    flags: RecordType,
    own_lock: bool,
    fsync: bool,
}

impl LogAppend {
    /// Begins a transaction. `flags` may hold `EXTERNAL` and `SYNC`; they
    /// are set on every record.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the log lock could not be taken, or an error
    /// from refreshing the log.
    pub fn begin(log: &TransactionLog, flags: RecordType) -> CoreResult<Self> {
        let own_lock = {
            let mut inner = log.lock_inner();
            if inner.is_locked() {
                inner.refresh()?;
                false
            } else {
                inner.lock()?;
                true
            }
        };

        let flags = flags & (RecordType::EXTERNAL | RecordType::SYNC);
        let mut buf = Vec::with_capacity(256);
        let start = begin_record(&mut buf, RecordKind::Boundary.type_bits() | flags.bits());
        buf.extend_from_slice(&0u32.to_le_bytes());
        finish_record(&mut buf, start);

        Ok(Self {
            log: log.clone(),
            buf,
            flags,
            own_lock,
            fsync: false,
        })
    }

    /// Adds one record.
    pub fn add(&mut self, kind: RecordKind, payload: &[u8]) {
        let start = begin_record(&mut self.buf, kind.type_bits() | self.flags.bits());
        self.buf.extend_from_slice(payload);
        finish_record(&mut self.buf, start);
    }

    /// Asks for the transaction to be forced to stable storage even when
    /// the fsync mode only syncs on request.
    pub fn request_fsync(&mut self) {
        self.fsync = true;
    }

    /// Returns true if no records were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.len() == BOUNDARY_RECORD_SIZE
    }

    /// Writes the transaction.
    ///
    /// The head file is rotated first if it is due. A write failure moves
    /// the log into memory and the transaction is written there instead.
    ///
    /// # Errors
    ///
    /// Returns an error if rotating fails, or writing fails even in memory.
    pub fn commit(mut self) -> CoreResult<LogSpan> {
        let log = self.log.clone();
        let mut inner = log.lock_inner();
        let result = if self.is_empty() {
            let head = inner.head();
            let pos = LogPosition::new(head.file_seq(), head.sync_offset);
            Ok(LogSpan { start: pos, end: pos })
        } else {
            self.write(&mut inner)
        };
        if self.own_lock {
            inner.unlock();
            self.own_lock = false;
        }
        result
    }

    fn write(&mut self, inner: &mut LogInner) -> CoreResult<LogSpan> {
        if !inner.head().is_in_memory() && inner.need_rotate()? {
            inner.rotate(false)?;
        }

        let head = inner.head();
        if head.max_tail_offset > head.saved_tail_offset {
            let tail = head.max_tail_offset;
            let start = begin_record(
                &mut self.buf,
                RecordKind::HeaderUpdate.type_bits() | RecordType::EXTERNAL.bits(),
            );
            encode_patch(&mut self.buf, offsets::LOG_FILE_TAIL_OFFSET as u16, &tail.to_le_bytes());
            finish_record(&mut self.buf, start);
        }

        let total = self.buf.len() as u32;
        self.buf[RECORD_HEADER_SIZE..BOUNDARY_RECORD_SIZE].copy_from_slice(&total.to_le_bytes());

        let sync = inner.config.sync_log_appends(self.fsync);
        let head = inner.head_mut();
        let start = LogPosition::new(head.file_seq(), head.sync_offset);
        if let Err(err) = head.write_transaction(&self.buf, sync) {
            if matches!(&err, CoreError::Storage(e) if e.is_out_of_space()) {
                tracing::warn!(path = %head.path.display(), %err, "out of disk space, keeping log in memory");
            } else {
                tracing::error!(path = %head.path.display(), %err, "failed to append to transaction log");
            }
            head.truncate_to_sync_offset();
            head.move_to_memory();
            head.write_transaction(&self.buf, false)?;
        }
        let end = LogPosition::new(head.file_seq(), head.sync_offset);
        tracing::trace!(file_seq = start.file_seq, start = start.offset, end = end.offset, "appended transaction");
        Ok(LogSpan { start, end })
    }
}

impl Drop for LogAppend {
    fn drop(&mut self) {
        if self.own_lock {
            self.log.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FsyncMode};
    use crate::log::format::LogFileHeader;
    use crate::log::records::AppendRecord;
    use crate::types::MailFlags;
    use mailindex_storage::{InMemoryBackend, StorageBackend, StorageResult};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn append_payload(uid: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        AppendRecord {
            uid,
            flags: MailFlags::SEEN,
        }
        .encode(&mut buf);
        buf
    }

    #[test]
    fn commit_frames_boundary_and_releases_lock() {
        let log = TransactionLog::in_memory(
            Path::new("mem.log"),
            &Config::default(),
            LogFileHeader::new(1, 1, 0, 0),
        );
        let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
        assert!(log.is_locked());
        assert!(append.is_empty());
        append.add(RecordKind::Append, &append_payload(1));
        let span = append.commit().unwrap();
        assert!(!log.is_locked());
        assert_eq!(span.start, LogPosition::new(1, 40));
        assert_eq!(span.end, LogPosition::new(1, 40 + 12 + 16));

        let inner = log.lock_inner();
        let data = inner.head().snapshot();
        let boundary = u32::from_le_bytes(data[48..52].try_into().unwrap());
        assert_eq!(boundary, 28);
    }

    #[test]
    fn external_lock_is_kept() {
        let log = TransactionLog::in_memory(
            Path::new("mem.log"),
            &Config::default(),
            LogFileHeader::new(1, 1, 0, 0),
        );
        log.lock().unwrap();
        let mut append = LogAppend::begin(&log, RecordType::EXTERNAL).unwrap();
        append.add(RecordKind::Append, &append_payload(1));
        append.commit().unwrap();
        assert!(log.is_locked());
        log.unlock();
    }

    #[test]
    fn dropped_append_writes_nothing() {
        let log = TransactionLog::in_memory(
            Path::new("mem.log"),
            &Config::default(),
            LogFileHeader::new(1, 1, 0, 0),
        );
        {
            let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
            append.add(RecordKind::Append, &append_payload(1));
        }
        assert!(!log.is_locked());
        assert_eq!(log.head_position(), LogPosition::new(1, 40));
    }

    #[test]
    fn tail_offset_is_folded_into_next_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mailindex.log");
        let log = TransactionLog::create(&path, &Config::default(), LogFileHeader::new(1, 1, 0, 0))
            .unwrap();
        let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
        append.add(RecordKind::Append, &append_payload(1));
        let first = append.commit().unwrap();

        log.set_max_tail_offset(1, first.end.offset);
        let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
        append.add(RecordKind::Append, &append_payload(2));
        append.commit().unwrap();

        let reopened = TransactionLog::open(&path, &Config::default()).unwrap().unwrap();
        let inner = reopened.lock_inner();
        assert_eq!(inner.head().saved_tail_offset, first.end.offset as u32);
    }

    /// Reads succeed, writes fail.
    #[derive(Debug)]
    struct FailingBackend(InMemoryBackend);

    impl StorageBackend for FailingBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.0.read_at(offset, len)
        }
        fn write_at(&mut self, _offset: u64, _data: &[u8]) -> StorageResult<()> {
            Err(std::io::Error::other("disk full").into())
        }
        fn size(&self) -> StorageResult<u64> {
            self.0.size()
        }
        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn truncate(&mut self, _new_size: u64) -> StorageResult<()> {
            Err(std::io::Error::other("disk full").into())
        }
    }

    /// Counts syncs.
    #[derive(Debug)]
    struct CountingBackend(InMemoryBackend, Arc<AtomicUsize>);

    impl StorageBackend for CountingBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.0.read_at(offset, len)
        }
        fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
            self.0.write_at(offset, data)
        }
        fn size(&self) -> StorageResult<u64> {
            self.0.size()
        }
        fn sync(&mut self) -> StorageResult<()> {
            self.1.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.0.truncate(new_size)
        }
    }

    fn syncs_for(mode: FsyncMode, request: bool) -> usize {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mailindex.log");
        let config = Config::default().fsync_mode(mode);
        let log = TransactionLog::create(&path, &config, LogFileHeader::new(1, 1, 0, 0)).unwrap();
        let header = std::fs::read(&path).unwrap();
        let syncs = Arc::new(AtomicUsize::new(0));
        log.replace_head_backend(Box::new(CountingBackend(
            InMemoryBackend::with_data(header),
            Arc::clone(&syncs),
        )));

        let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
        append.add(RecordKind::Append, &append_payload(1));
        if request {
            append.request_fsync();
        }
        append.commit().unwrap();
        syncs.load(Ordering::Relaxed)
    }

    #[test]
    fn fsync_mode_decides_append_syncs() {
        assert_eq!(syncs_for(FsyncMode::Optimized, false), 0);
        assert_eq!(syncs_for(FsyncMode::Optimized, true), 2);
        assert_eq!(syncs_for(FsyncMode::Always, false), 2);
        assert_eq!(syncs_for(FsyncMode::Never, true), 0);
    }

    #[test]
    fn write_failure_moves_log_to_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mailindex.log");
        let log = TransactionLog::create(&path, &Config::default(), LogFileHeader::new(1, 1, 0, 0))
            .unwrap();
        let header = LogFileHeader::decode(&path, &std::fs::read(&path).unwrap())
            .unwrap()
            .encode();
        log.replace_head_backend(Box::new(FailingBackend(InMemoryBackend::with_data(header))));

        let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
        append.add(RecordKind::Append, &append_payload(1));
        let span = append.commit().unwrap();
        assert!(log.is_in_memory());
        assert_eq!(span.end, LogPosition::new(1, 68));
        // Nothing reached the file.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);
    }
}
