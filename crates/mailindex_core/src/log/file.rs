//! One transaction log file.

use crate::error::{CoreError, CoreResult};
use crate::index::header::offsets;
use crate::lock::FileLock;
use crate::log::format::{
    decode_size, LogFileHeader, RecordKind, RecordType, RECORD_HEADER_SIZE,
};
use crate::log::records::{decode_patches, modseq_after, RecordContext};
use crate::types::Modseq;
use fs2::FileExt;
use mailindex_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A log file in the arena.
///
/// `buffer` holds the file's bytes from offset 0 up to what has been read;
/// views take cheap snapshots of it. `sync_offset` is where the durable,
/// fully written records end and the next append goes.
pub(crate) struct LogFile {
    pub(crate) path: PathBuf,
    pub(crate) hdr: LogFileHeader,
    backend: Box<dyn StorageBackend>,
    buffer: Arc<Vec<u8>>,
    pub(crate) sync_offset: u64,
    /// Tail offset last written into this file.
    pub(crate) saved_tail_offset: u32,
    /// Highest tail offset any index has reported absorbing.
    pub(crate) max_tail_offset: u32,
    /// Modseq after the record ending at `sync_offset`.
    pub(crate) highest_modseq: Modseq,
    identity: Option<same_file::Handle>,
    /// Number of views referencing this file.
    pub(crate) refcount: u32,
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("path", &self.path)
            .field("file_seq", &self.hdr.file_seq)
            .field("sync_offset", &self.sync_offset)
            .field("in_memory", &self.backend.is_in_memory())
            .field("refcount", &self.refcount)
            .finish()
    }
}

impl LogFile {
    /// Opens an existing log file. Returns `None` if it does not exist.
    pub(crate) fn open(path: &Path) -> CoreResult<Option<Self>> {
        let backend = match FileBackend::open_existing(path) {
            Ok(backend) => backend,
            Err(mailindex_storage::StorageError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        };
        let identity = same_file::Handle::from_path(path)?;
        let size = backend.size()?;
        let data = backend.read_at(0, size as usize)?;
        let hdr = LogFileHeader::decode(path, &data)?;

        let mut file = Self {
            path: path.to_path_buf(),
            hdr,
            backend: Box::new(backend),
            buffer: Arc::new(data),
            sync_offset: u64::from(hdr.hdr_size),
            saved_tail_offset: 0,
            max_tail_offset: 0,
            highest_modseq: hdr.initial_modseq,
            identity: Some(identity),
            refcount: 0,
        };
        file.scan()?;
        file.max_tail_offset = file.saved_tail_offset;
        tracing::debug!(path = %path.display(), file_seq = hdr.file_seq, sync_offset = file.sync_offset, "opened log file");
        Ok(Some(file))
    }

    /// Creates a log file at `path` atomically: the header is written to
    /// `<path>.newlock`, synced and renamed into place. An existing file at
    /// `path` is first renamed to `rotate_to`, if given.
    ///
    /// With `lock` set, the new file is flocked before it becomes visible
    /// and the lock is returned.
    pub(crate) fn create(
        path: &Path,
        hdr: LogFileHeader,
        rotate_to: Option<&Path>,
        lock: bool,
    ) -> CoreResult<(Self, Option<FileLock>)> {
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".newlock");
        let tmp_path = PathBuf::from(tmp_name);

        let data = hdr.encode();
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&data)?;
        tmp.sync_all()?;
        if lock {
            FileExt::try_lock_exclusive(&tmp)?;
        }

        if let Some(rotate_to) = rotate_to {
            match fs::rename(path, rotate_to) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        fs::rename(&tmp_path, path)?;

        let backend = FileBackend::open_existing(path)?;
        let identity = same_file::Handle::from_path(path)?;
        tracing::debug!(path = %path.display(), file_seq = hdr.file_seq, prev_file_seq = hdr.prev_file_seq, "created log file");
        let file = Self::from_parts(path, hdr, Box::new(backend), data, Some(identity));
        let lock = lock.then(|| FileLock::Flock {
            path: path.to_path_buf(),
            file: tmp,
        });
        Ok((file, lock))
    }

    /// Creates a log file that only lives in memory.
    pub(crate) fn in_memory(path: &Path, hdr: LogFileHeader) -> Self {
        let data = hdr.encode();
        let backend = InMemoryBackend::with_data(data.clone());
        Self::from_parts(path, hdr, Box::new(backend), data, None)
    }

    fn from_parts(
        path: &Path,
        hdr: LogFileHeader,
        backend: Box<dyn StorageBackend>,
        data: Vec<u8>,
        identity: Option<same_file::Handle>,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            hdr,
            backend,
            buffer: Arc::new(data),
            sync_offset: u64::from(hdr.hdr_size),
            saved_tail_offset: 0,
            max_tail_offset: 0,
            highest_modseq: hdr.initial_modseq,
            identity,
            refcount: 0,
        }
    }

    pub(crate) fn file_seq(&self) -> u32 {
        self.hdr.file_seq
    }

    pub(crate) fn is_in_memory(&self) -> bool {
        self.backend.is_in_memory()
    }

    /// Returns a snapshot of the bytes read so far.
    pub(crate) fn snapshot(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.buffer)
    }

    /// Returns the current on-disk (or in-memory) size.
    pub(crate) fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Returns true if `path` still names this file.
    pub(crate) fn is_current_at(&self, path: &Path) -> CoreResult<bool> {
        let Some(identity) = &self.identity else {
            return Ok(true);
        };
        match same_file::Handle::from_path(path) {
            Ok(handle) => Ok(&handle == identity),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Rereads everything past `sync_offset` and scans the complete
    /// records in it.
    ///
    /// Bytes past `sync_offset` may belong to a transaction whose size was
    /// not yet patched when they were last read, so they are never trusted
    /// from the buffer.
    pub(crate) fn read_new(&mut self) -> CoreResult<()> {
        let size = self.backend.refresh_size()?;
        if size < self.sync_offset {
            tracing::warn!(path = %self.path.display(), size, sync_offset = self.sync_offset, "log file shrank");
            self.sync_offset = size.max(u64::from(self.hdr.hdr_size));
        }
        let synced = self.sync_offset;
        if self.buffer.len() as u64 == synced && size <= synced {
            return Ok(());
        }

        let more = if size > synced {
            self.backend.read_at(synced, (size - synced) as usize)?
        } else {
            Vec::new()
        };
        let buffer = Arc::make_mut(&mut self.buffer);
        buffer.truncate(synced as usize);
        buffer.extend_from_slice(&more);
        self.scan()
    }

    /// Advances `sync_offset` over complete records in the buffer,
    /// tracking tail offset updates and the modseq.
    ///
    /// A zero size, a record extending past the buffer or a transaction
    /// whose BOUNDARY claims more bytes than are present ends the scan: it
    /// is still being written.
    fn scan(&mut self) -> CoreResult<()> {
        let data = Arc::clone(&self.buffer);
        let end = data.len() as u64;
        let path = self.path.clone();
        while self.sync_offset + RECORD_HEADER_SIZE as u64 <= end {
            let at = self.sync_offset as usize;
            let raw_type = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
            let size = decode_size([data[at + 4], data[at + 5], data[at + 6], data[at + 7]]);
            if size == 0 || self.sync_offset + u64::from(size) > end {
                break;
            }
            let ctx = RecordContext {
                path: &path,
                offset: self.sync_offset,
                raw_type,
            };
            if (size as usize) < RECORD_HEADER_SIZE {
                return Err(ctx.corrupt(format!("record size {size} < {RECORD_HEADER_SIZE}")));
            }
            let payload = &data[at + RECORD_HEADER_SIZE..at + size as usize];
            let record_type = RecordType::from_bits_retain(raw_type);
            if record_type.kind() == Some(RecordKind::Boundary) && payload.len() >= 4 {
                let total = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                if self.sync_offset + u64::from(total) > end {
                    break;
                }
            }
            if record_type.kind() == Some(RecordKind::HeaderUpdate) && record_type.is_external() {
                if let Some(tail) = tail_offset_update(&ctx, payload)? {
                    self.saved_tail_offset = tail;
                    self.max_tail_offset = self.max_tail_offset.max(tail);
                }
            }
            if let Some(kind) = RecordType::strip_protection(raw_type).and_then(RecordType::kind) {
                self.highest_modseq = modseq_after(&ctx, kind, payload, self.highest_modseq)?;
            }
            self.sync_offset += u64::from(size);
        }
        Ok(())
    }

    /// Writes a complete transaction at `sync_offset`.
    ///
    /// The transaction goes out with its first record's size zeroed, and
    /// the size is patched in by a second write, so a torn write is never
    /// mistaken for a record. Trailing junk from an earlier failed write is
    /// truncated first.
    pub(crate) fn write_transaction(&mut self, data: &[u8], sync: bool) -> CoreResult<()> {
        debug_assert!(data.len() >= RECORD_HEADER_SIZE);
        let offset = self.sync_offset;
        if self.backend.refresh_size()? > offset {
            tracing::warn!(path = %self.path.display(), offset, "truncating partially written data");
            self.backend.truncate(offset)?;
        }

        let mut first = data.to_vec();
        first[4..8].fill(0);
        self.backend.write_at(offset, &first)?;
        if sync {
            self.backend.sync()?;
        }
        self.backend.write_at(offset + 4, &data[4..8])?;
        if sync {
            self.backend.sync()?;
        }

        let buffer = Arc::make_mut(&mut self.buffer);
        buffer.truncate(offset as usize);
        buffer.extend_from_slice(data);
        self.scan()?;
        debug_assert_eq!(self.sync_offset, offset + data.len() as u64);
        Ok(())
    }

    /// Discards anything written past `sync_offset`, ignoring errors.
    pub(crate) fn truncate_to_sync_offset(&mut self) {
        if let Err(err) = self.backend.truncate(self.sync_offset) {
            tracing::warn!(path = %self.path.display(), %err, "failed to truncate log after write error");
        }
    }

    /// Replaces the backing store with process memory holding the durable
    /// part of the file. Used after a write failure.
    pub(crate) fn move_to_memory(&mut self) {
        let mut data = self.buffer.as_ref().clone();
        data.truncate(self.sync_offset as usize);
        Arc::make_mut(&mut self.buffer).truncate(self.sync_offset as usize);
        self.backend = Box::new(InMemoryBackend::with_data(data));
        self.identity = None;
        tracing::warn!(path = %self.path.display(), file_seq = self.hdr.file_seq, "transaction log moved to memory");
    }

    #[cfg(test)]
    pub(crate) fn replace_backend(&mut self, backend: Box<dyn StorageBackend>) {
        self.backend = backend;
    }
}

/// Returns the tail offset an EXTERNAL header update sets, if any.
fn tail_offset_update(ctx: &RecordContext<'_>, payload: &[u8]) -> CoreResult<Option<u32>> {
    let mut tail = None;
    for (offset, data) in decode_patches(ctx, payload)? {
        if usize::from(offset) == offsets::LOG_FILE_TAIL_OFFSET && data.len() == 4 {
            tail = Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
        }
    }
    Ok(tail)
}

/// Computes the modseq in effect at `offset` of a file by replaying the
/// record headers before it.
pub(crate) fn modseq_at(
    path: &Path,
    hdr: &LogFileHeader,
    data: &[u8],
    offset: u64,
) -> CoreResult<Modseq> {
    let mut modseq = hdr.initial_modseq;
    let mut pos = u64::from(hdr.hdr_size);
    while pos < offset {
        let at = pos as usize;
        let header = data.get(at..at + RECORD_HEADER_SIZE).ok_or_else(|| {
            CoreError::log_corrupted(path, pos, 0, "offset points past the end of the file")
        })?;
        let raw_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = decode_size([header[4], header[5], header[6], header[7]]);
        let ctx = RecordContext { path, offset: pos, raw_type };
        if (size as usize) < RECORD_HEADER_SIZE || pos + u64::from(size) > offset {
            return Err(ctx.corrupt(format!("offset {offset} is not at a record boundary")));
        }
        let payload = &data[at + RECORD_HEADER_SIZE..at + size as usize];
        if let Some(kind) = RecordType::strip_protection(raw_type).and_then(RecordType::kind) {
            modseq = modseq_after(&ctx, kind, payload, modseq)?;
        }
        pos += u64::from(size);
    }
    Ok(modseq)
}
