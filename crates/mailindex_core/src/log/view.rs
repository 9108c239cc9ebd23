//! Bounded, replayable cursor over chained log files.
//!
//! A view resolves its bounds to a run of chained files once, pins them in
//! the log's arena, and then walks their records. Every record handed out
//! has been validated for its kind; the first violation marks the view
//! broken for good.

use crate::error::{CoreError, CoreResult};
use crate::log::file::modseq_at;
use crate::log::format::{
    decode_size, LogFileHeader, RecordHeader, RecordKind, RecordType, RECORD_HEADER_SIZE,
};
use crate::log::records::{
    decode_boundary, decode_ext_reset, decode_patches, decode_uid_ranges, modseq_after,
    AppendRecord, ExpungeGuid, ExtAtomicInc, ExtIntro, FlagUpdate, KeywordUpdate,
    RecordContext,
};
use crate::log::transaction_log::{LogPosition, TransactionLog};
use crate::types::{Modseq, Uid};
use std::path::PathBuf;
use std::sync::Arc;

/// A pinned slice of one log file.
#[derive(Debug)]
struct ViewFile {
    seq: u32,
    path: PathBuf,
    hdr: LogFileHeader,
    data: Arc<Vec<u8>>,
    start: u64,
    end: u64,
}

/// Replay state; saved and restored by mark/rewind.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    file_idx: usize,
    offset: u64,
    modseq: Modseq,
    append_uid: Uid,
    prev: LogPosition,
}

/// A read-only window over the transaction log.
#[derive(Debug)]
pub struct LogView {
    log: TransactionLog,
    files: Vec<ViewFile>,
    cur: Cursor,
    mark: Option<Cursor>,
    max: LogPosition,
    reset: bool,
    broken: bool,
}

impl LogView {
    /// Opens an empty view on `log`. Call [`LogView::set_bounds`] before
    /// reading.
    #[must_use]
    pub fn open(log: &TransactionLog) -> Self {
        Self {
            log: log.clone(),
            files: Vec::new(),
            cur: Cursor::default(),
            mark: None,
            max: LogPosition::default(),
            reset: false,
            broken: false,
        }
    }

    /// Positions the view on the records between `min` and `max`.
    ///
    /// `max.offset == u64::MAX` means "everything synced so far" in the max
    /// file. Offsets below a file's header size are raised to it.
    ///
    /// Returns true if the range crosses an index reset: a file in it does
    /// not continue its predecessor, and replay starts at that file.
    ///
    /// # Errors
    ///
    /// - `LogHistoryLost` if a file in the chain is missing or does not link
    ///   to its predecessor; the caller should rebuild instead
    /// - `LogCorrupted` if the files disagree about where they end; the view
    ///   is then broken
    /// - `ViewBroken` if the view was already broken
    /// - `InvalidOperation` if `min` is after `max`
    pub fn set_bounds(&mut self, min: LogPosition, max: LogPosition) -> CoreResult<bool> {
        self.resolve(Some(min), max)
    }

    /// Positions the view from the oldest record still available up to
    /// `max`, for rebuilding an index from the log.
    ///
    /// Returns true if that history is complete: the oldest file reached
    /// starts the log or resets the index.
    ///
    /// # Errors
    ///
    /// As for [`LogView::set_bounds`], except that a missing older file
    /// ends the walk instead of failing it.
    pub fn set_bounds_from_oldest(&mut self, max: LogPosition) -> CoreResult<bool> {
        self.resolve(None, max)?;
        Ok(self.files.first().is_some_and(|file| file.hdr.prev_file_seq == 0))
    }

    fn resolve(&mut self, min: Option<LogPosition>, max: LogPosition) -> CoreResult<bool> {
        if self.broken {
            return Err(CoreError::ViewBroken);
        }
        if let Some(min) = min {
            if min > max {
                return Err(CoreError::invalid_operation(format!(
                    "view bounds {}/{} > {}/{}",
                    min.file_seq, min.offset, max.file_seq, max.offset
                )));
            }
        }
        let (files, reset) = match self.collect(min, max) {
            Ok(resolved) => resolved,
            Err(err) => return Err(self.fail(err)),
        };
        self.pin(files);
        self.max = max;
        self.reset = reset;
        self.mark = None;
        self.rewind_to_start()?;
        Ok(reset)
    }

    fn rewind_to_start(&mut self) -> CoreResult<()> {
        let start = match self.files.first() {
            Some(file) => modseq_at(&file.path, &file.hdr, &file.data, file.start)
                .map(|modseq| (file.seq, file.start, modseq)),
            None => Ok((0, 0, 0)),
        };
        let (seq, offset, modseq) = start.map_err(|err| self.fail(err))?;
        self.cur = Cursor {
            file_idx: 0,
            offset,
            modseq,
            append_uid: 0,
            prev: LogPosition::new(seq, offset),
        };
        Ok(())
    }

    /// Walks the chain newest first, resolving each file's range.
    fn collect(
        &self,
        min: Option<LogPosition>,
        max: LogPosition,
    ) -> CoreResult<(Vec<ViewFile>, bool)> {
        let mut inner = self.log.lock_inner();
        if max.file_seq > inner.head_seq {
            return Err(CoreError::history_lost(
                max.file_seq,
                format!("log head is file seq {}", inner.head_seq),
            ));
        }

        let mut files = Vec::new();
        let mut reset = false;
        let mut seq = max.file_seq;
        let mut newer_prev_offset: Option<u64> = None;
        loop {
            let Some(file) = inner.load_file(seq)? else {
                if min.is_none() && !files.is_empty() {
                    break;
                }
                return Err(CoreError::history_lost(seq, "log file not found"));
            };

            let hdr_size = u64::from(file.hdr.hdr_size);
            let end = match newer_prev_offset {
                None if max.offset == u64::MAX => file.sync_offset,
                None => {
                    if max.offset > file.sync_offset {
                        return Err(CoreError::log_corrupted(
                            &file.path,
                            max.offset,
                            0,
                            format!("view end {} beyond sync offset {}", max.offset, file.sync_offset),
                        ));
                    }
                    max.offset.max(hdr_size)
                }
                Some(prev_offset) => {
                    if prev_offset > file.sync_offset {
                        return Err(CoreError::log_corrupted(
                            &file.path,
                            prev_offset,
                            0,
                            format!(
                                "file seq {} continues at offset {prev_offset}, but file seq {seq} only synced {}",
                                seq + 1,
                                file.sync_offset
                            ),
                        ));
                    }
                    prev_offset.max(hdr_size)
                }
            };
            let start = match min {
                Some(min) if min.file_seq == seq => min.offset.max(hdr_size),
                _ => hdr_size,
            };
            if start > end {
                return Err(CoreError::log_corrupted(
                    &file.path,
                    start,
                    0,
                    format!("view start {start} beyond end {end}"),
                ));
            }

            files.push(ViewFile {
                seq,
                path: file.path.clone(),
                hdr: file.hdr,
                data: file.snapshot(),
                start,
                end,
            });

            if min.is_some_and(|min| min.file_seq >= seq) {
                break;
            }
            let prev_seq = file.hdr.prev_file_seq;
            if prev_seq == 0 {
                reset = min.is_some();
                break;
            }
            if prev_seq != seq - 1 {
                return Err(CoreError::history_lost(
                    seq - 1,
                    format!("file seq {seq} continues file seq {prev_seq}"),
                ));
            }
            newer_prev_offset = Some(file.hdr.prev_file_offset);
            seq = prev_seq;
        }
        files.reverse();
        Ok((files, reset))
    }

    fn pin(&mut self, files: Vec<ViewFile>) {
        let mut inner = self.log.lock_inner();
        for file in &files {
            if let Some(arena_file) = inner.files.get_mut(&file.seq) {
                arena_file.refcount += 1;
            }
        }
        for file in &self.files {
            if let Some(arena_file) = inner.files.get_mut(&file.seq) {
                arena_file.refcount = arena_file.refcount.saturating_sub(1);
            }
        }
        self.files = files;
    }

    fn fail(&mut self, err: CoreError) -> CoreError {
        if err.is_corruption() {
            tracing::error!(%err, "transaction log view broken");
            self.broken = true;
        }
        err
    }

    /// Returns the next record, or `None` at the end of the range.
    ///
    /// The expunge protection mask is stripped from the returned type. A
    /// record whose size is still zero ends the range without error: it is
    /// being written.
    ///
    /// # Errors
    ///
    /// Returns `LogCorrupted` for a record that fails validation (the view
    /// is broken from then on) or `ViewBroken` if it already was.
    pub fn next(&mut self) -> CoreResult<Option<(RecordHeader, &[u8])>> {
        Ok(self
            .next_record()?
            .map(|(_, header, payload)| (header, payload)))
    }

    /// Like [`LogView::next`], also returning where the record is, for
    /// error reports.
    ///
    /// # Errors
    ///
    /// As for [`LogView::next`].
    pub fn next_record(&mut self) -> CoreResult<Option<(RecordContext<'_>, RecordHeader, &[u8])>> {
        if self.broken {
            return Err(CoreError::ViewBroken);
        }
        match self.advance() {
            Ok(Some((header, idx, at))) => {
                let file = &self.files[idx];
                let ctx = RecordContext {
                    path: &file.path,
                    offset: at as u64,
                    raw_type: header.record_type.bits(),
                };
                let payload = &file.data[at + RECORD_HEADER_SIZE..at + header.size as usize];
                Ok(Some((ctx, header, payload)))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Moves the cursor over one record, returning its header, file index
    /// and offset.
    fn advance(&mut self) -> CoreResult<Option<(RecordHeader, usize, usize)>> {
        loop {
            let Some(file) = self.files.get(self.cur.file_idx) else {
                return Ok(None);
            };
            if self.cur.offset < file.end {
                break;
            }
            if self.cur.file_idx + 1 >= self.files.len() {
                return Ok(None);
            }
            self.cur.file_idx += 1;
            self.cur.offset = self.files[self.cur.file_idx].start;
            if self.files[self.cur.file_idx].hdr.prev_file_seq == 0 {
                self.cur.append_uid = 0;
            }
        }

        let idx = self.cur.file_idx;
        let file = &self.files[idx];
        let offset = self.cur.offset;
        let at = offset as usize;
        let data = Arc::clone(&file.data);
        let remaining = file.end - offset;
        if remaining < RECORD_HEADER_SIZE as u64 {
            return Err(CoreError::log_corrupted(
                &file.path,
                offset,
                0,
                format!("record header needs {RECORD_HEADER_SIZE} bytes, {remaining} left"),
            ));
        }
        let raw_type = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let size = decode_size([data[at + 4], data[at + 5], data[at + 6], data[at + 7]]);
        if size == 0 {
            return Ok(None);
        }

        let path = file.path.clone();
        let ctx = RecordContext {
            path: &path,
            offset,
            raw_type,
        };
        if (size as usize) < RECORD_HEADER_SIZE {
            return Err(ctx.corrupt(format!("record size {size} < {RECORD_HEADER_SIZE}")));
        }
        if u64::from(size) > remaining {
            return Err(ctx.corrupt(format!(
                "record size {size} overruns range: {remaining} bytes left"
            )));
        }
        let record_type = RecordType::strip_protection(raw_type)
            .ok_or_else(|| ctx.corrupt("expunge record without protection mask"))?;
        let kind = record_type
            .kind()
            .ok_or_else(|| ctx.corrupt("unknown record type"))?;

        let payload = &data[at + RECORD_HEADER_SIZE..at + size as usize];
        self.validate(&ctx, kind, payload, remaining)?;
        self.cur.modseq = modseq_after(&ctx, kind, payload, self.cur.modseq)?;
        self.cur.prev = LogPosition::new(self.files[idx].seq, offset);
        self.cur.offset += u64::from(size);
        Ok(Some((RecordHeader { record_type, size }, idx, at)))
    }

    fn validate(
        &mut self,
        ctx: &RecordContext<'_>,
        kind: RecordKind,
        payload: &[u8],
        remaining: u64,
    ) -> CoreResult<()> {
        match kind {
            RecordKind::Append => {
                for rec in AppendRecord::decode_all(ctx, payload)? {
                    if rec.uid == 0 || rec.uid <= self.cur.append_uid {
                        return Err(ctx.corrupt(format!(
                            "append uid {} not after {}",
                            rec.uid, self.cur.append_uid
                        )));
                    }
                    self.cur.append_uid = rec.uid;
                }
            }
            RecordKind::Expunge | RecordKind::KeywordReset => {
                decode_uid_ranges(ctx, payload)?;
            }
            RecordKind::ExpungeGuid => {
                ExpungeGuid::decode_all(ctx, payload)?;
            }
            RecordKind::FlagUpdate => {
                FlagUpdate::decode_all(ctx, payload)?;
            }
            RecordKind::KeywordUpdate => {
                KeywordUpdate::decode(ctx, payload)?;
            }
            RecordKind::ExtIntro => {
                ExtIntro::decode(ctx, payload)?;
            }
            RecordKind::ExtReset => {
                decode_ext_reset(ctx, payload)?;
            }
            RecordKind::HeaderUpdate | RecordKind::ExtHdrUpdate => {
                decode_patches(ctx, payload)?;
            }
            RecordKind::ExtAtomicInc => {
                ExtAtomicInc::decode_all(ctx, payload)?;
            }
            RecordKind::Boundary => {
                let len = decode_boundary(ctx, payload)?;
                if u64::from(len) > remaining {
                    return Err(ctx.corrupt(format!(
                        "transaction of {len} bytes overruns range: {remaining} bytes left"
                    )));
                }
            }
            // Record data is checked against the extension layout on replay.
            RecordKind::ExtRecUpdate | RecordKind::ModseqUpdate => {}
        }
        Ok(())
    }

    /// Remembers the current position for [`LogView::rewind`].
    pub fn mark(&mut self) {
        self.mark = Some(self.cur);
    }

    /// Returns to the last marked position, or to the start of the range if
    /// nothing was marked.
    ///
    /// # Errors
    ///
    /// Returns `ViewBroken` if the view is broken.
    pub fn rewind(&mut self) -> CoreResult<()> {
        if self.broken {
            return Err(CoreError::ViewBroken);
        }
        match self.mark {
            Some(mark) => {
                self.cur = mark;
                Ok(())
            }
            None => self.rewind_to_start(),
        }
    }

    /// Returns the position of the last record returned.
    #[must_use]
    pub fn prev_position(&self) -> LogPosition {
        self.cur.prev
    }

    /// Returns the position of the next record.
    #[must_use]
    pub fn position(&self) -> LogPosition {
        match self.files.get(self.cur.file_idx) {
            Some(file) => LogPosition::new(file.seq, self.cur.offset),
            None => LogPosition::default(),
        }
    }

    /// Returns the position where the range ends.
    #[must_use]
    pub fn end_position(&self) -> LogPosition {
        match self.files.last() {
            Some(file) => LogPosition::new(file.seq, file.end),
            None => self.max,
        }
    }

    /// Returns the modseq after the last record returned.
    #[must_use]
    pub fn prev_modseq(&self) -> Modseq {
        self.cur.modseq
    }

    /// Returns true if the bounds cross an index reset.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// Returns true once corruption has been seen.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Returns the sequences of the files the view spans, oldest first.
    #[must_use]
    pub fn file_seqs(&self) -> Vec<u32> {
        self.files.iter().map(|file| file.seq).collect()
    }
}

impl Drop for LogView {
    fn drop(&mut self) {
        self.pin(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log::append::LogAppend;
    use crate::log::format::{begin_record, encode_size, finish_record};
    use crate::log::records::encode_uid_ranges;
    use crate::types::MailFlags;
    use std::path::Path;

    fn log() -> TransactionLog {
        TransactionLog::in_memory(
            Path::new("mem.log"),
            &Config::default(),
            LogFileHeader::new(5, 1, 0, 0),
        )
    }

    fn commit_appends(log: &TransactionLog, uids: &[u32]) {
        let mut append = LogAppend::begin(log, RecordType::empty()).unwrap();
        let mut payload = Vec::new();
        for &uid in uids {
            AppendRecord {
                uid,
                flags: MailFlags::empty(),
            }
            .encode(&mut payload);
        }
        append.add(RecordKind::Append, &payload);
        append.commit().unwrap();
    }

    fn write_raw(log: &TransactionLog, tx: &[u8]) {
        let mut inner = log.lock_inner();
        inner.head_mut().write_transaction(tx, false).unwrap();
    }

    fn kinds(view: &mut LogView) -> Vec<RecordKind> {
        let mut kinds = Vec::new();
        while let Some((hdr, _)) = view.next().unwrap() {
            kinds.push(hdr.kind().unwrap());
        }
        kinds
    }

    #[test]
    fn reads_whole_log() {
        let log = log();
        commit_appends(&log, &[1, 2]);
        commit_appends(&log, &[3]);

        let mut view = LogView::open(&log);
        let reset = view
            .set_bounds(LogPosition::new(1, 0), LogPosition::new(1, u64::MAX))
            .unwrap();
        assert!(!reset);
        assert_eq!(
            kinds(&mut view),
            vec![
                RecordKind::Boundary,
                RecordKind::Append,
                RecordKind::Boundary,
                RecordKind::Append
            ]
        );
        assert_eq!(view.prev_modseq(), 2);
        assert_eq!(view.position(), log.head_position());
    }

    #[test]
    fn expunge_protection_is_stripped() {
        let log = log();
        let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
        let mut payload = Vec::new();
        encode_uid_ranges(&mut payload, &[(1, 2)]);
        append.add(RecordKind::Expunge, &payload);
        append.commit().unwrap();

        let mut view = LogView::open(&log);
        view.set_bounds(LogPosition::new(1, 0), LogPosition::new(1, u64::MAX))
            .unwrap();
        view.next().unwrap().unwrap();
        let (hdr, data) = view.next().unwrap().unwrap();
        assert_eq!(hdr.record_type, RecordType::EXPUNGE);
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn expunge_without_protection_is_corrupt() {
        let log = log();
        let mut tx = Vec::new();
        let start = begin_record(&mut tx, RecordType::EXPUNGE.bits());
        encode_uid_ranges(&mut tx, &[(1, 1)]);
        finish_record(&mut tx, start);
        write_raw(&log, &tx);

        let mut view = LogView::open(&log);
        view.set_bounds(LogPosition::new(1, 0), LogPosition::new(1, u64::MAX))
            .unwrap();
        let err = view.next().unwrap_err();
        assert!(matches!(err, CoreError::LogCorrupted { offset: 40, .. }));
        assert!(view.is_broken());
        assert!(matches!(view.next(), Err(CoreError::ViewBroken)));
        assert!(matches!(view.rewind(), Err(CoreError::ViewBroken)));
        assert!(matches!(
            view.set_bounds(LogPosition::new(1, 0), LogPosition::new(1, u64::MAX)),
            Err(CoreError::ViewBroken)
        ));
    }

    #[test]
    fn decreasing_append_uids_are_corrupt() {
        let log = log();
        commit_appends(&log, &[5]);
        let mut tx = Vec::new();
        let start = begin_record(&mut tx, RecordKind::Append.type_bits());
        AppendRecord {
            uid: 4,
            flags: MailFlags::empty(),
        }
        .encode(&mut tx);
        finish_record(&mut tx, start);
        write_raw(&log, &tx);

        let mut view = LogView::open(&log);
        view.set_bounds(LogPosition::new(1, 0), LogPosition::new(1, u64::MAX))
            .unwrap();
        view.next().unwrap();
        view.next().unwrap();
        let err = view.next().unwrap_err();
        assert!(err.to_string().contains("append uid 4 not after 5"));
    }

    #[test]
    fn oversized_record_is_corrupt() {
        let log = log();
        let mut tx = Vec::new();
        let start = begin_record(&mut tx, RecordKind::Append.type_bits());
        AppendRecord {
            uid: 1,
            flags: MailFlags::empty(),
        }
        .encode(&mut tx);
        finish_record(&mut tx, start);
        write_raw(&log, &tx);

        // Claim more bytes than the range has.
        let mut inner = log.lock_inner();
        let head = inner.head_mut();
        let mut data = head.snapshot().as_ref().clone();
        data[44..48].copy_from_slice(&encode_size(64));
        drop(inner);

        let mut view = LogView::open(&log);
        view.set_bounds(LogPosition::new(1, 0), LogPosition::new(1, u64::MAX))
            .unwrap();
        view.files[0].data = Arc::new(data);
        let err = view.next().unwrap_err();
        assert!(err.to_string().contains("record size 64 overruns range: 16 bytes left"));
    }

    #[test]
    fn mark_and_rewind_replay_the_same_records() {
        let log = log();
        commit_appends(&log, &[1]);
        commit_appends(&log, &[2]);

        let mut view = LogView::open(&log);
        view.set_bounds(LogPosition::new(1, 0), LogPosition::new(1, u64::MAX))
            .unwrap();
        view.next().unwrap();
        view.next().unwrap();
        view.mark();
        let first_pass = kinds(&mut view);
        let modseq = view.prev_modseq();
        view.rewind().unwrap();
        assert_eq!(kinds(&mut view), first_pass);
        assert_eq!(view.prev_modseq(), modseq);

        view.mark = None;
        view.rewind().unwrap();
        assert_eq!(kinds(&mut view).len(), 4);
    }

    #[test]
    fn bounds_span_rotated_files() {
        let log = log();
        commit_appends(&log, &[1]);
        log.lock().unwrap();
        log.rotate(false).unwrap();
        log.unlock();
        commit_appends(&log, &[2]);

        let mut view = LogView::open(&log);
        let reset = view
            .set_bounds(LogPosition::new(1, 40), LogPosition::new(2, u64::MAX))
            .unwrap();
        assert!(!reset);
        assert_eq!(view.file_seqs(), vec![1, 2]);
        assert_eq!(kinds(&mut view).len(), 4);
        assert_eq!(log.lock_inner().files[&1].refcount, 1);
        drop(view);
        assert_eq!(log.lock_inner().files[&1].refcount, 0);
    }

    #[test]
    fn reset_file_cuts_history() {
        let log = log();
        commit_appends(&log, &[1]);
        log.lock().unwrap();
        log.rotate(true).unwrap();
        log.unlock();
        commit_appends(&log, &[1]);

        let mut view = LogView::open(&log);
        let reset = view
            .set_bounds(LogPosition::new(1, 40), LogPosition::new(2, u64::MAX))
            .unwrap();
        assert!(reset);
        assert_eq!(view.file_seqs(), vec![2]);
        assert_eq!(kinds(&mut view).len(), 2);
    }

    #[test]
    fn missing_history_is_not_corruption() {
        let log = log();
        log.lock().unwrap();
        log.rotate(false).unwrap();
        log.rotate(false).unwrap();
        log.unlock();
        log.free_unused(3);

        let mut view = LogView::open(&log);
        let err = view
            .set_bounds(LogPosition::new(1, 40), LogPosition::new(3, u64::MAX))
            .unwrap_err();
        assert!(matches!(err, CoreError::LogHistoryLost { file_seq: 2, .. }));
        assert!(!view.is_broken());

        assert!(!view.set_bounds_from_oldest(LogPosition::new(3, u64::MAX)).unwrap());
        assert_eq!(view.file_seqs(), vec![3]);
    }

    #[test]
    fn end_beyond_sync_offset_is_corrupt() {
        let log = log();
        commit_appends(&log, &[1]);
        let mut view = LogView::open(&log);
        let err = view
            .set_bounds(LogPosition::new(1, 40), LogPosition::new(1, 500))
            .unwrap_err();
        assert!(err.is_corruption());
        assert!(view.is_broken());
    }

    #[test]
    fn min_after_max_is_rejected() {
        let log = log();
        let mut view = LogView::open(&log);
        let err = view
            .set_bounds(LogPosition::new(1, 80), LogPosition::new(1, 40))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn zero_size_stops_cleanly() {
        let log = log();
        commit_appends(&log, &[1]);
        let mut view = LogView::open(&log);
        view.set_bounds(LogPosition::new(1, 40), LogPosition::new(1, u64::MAX))
            .unwrap();

        let mut data = view.files[0].data.as_ref().clone();
        data[44..48].fill(0);
        view.files[0].data = Arc::new(data);
        assert!(view.next().unwrap().is_none());
        assert!(!view.is_broken());
    }
}
