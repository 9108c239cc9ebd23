//! The fixed index header.

use crate::cursor::{put_u16, put_u32, ByteCursor};
use crate::error::{CoreError, CoreResult};
use bitflags::bitflags;
use std::path::Path;

/// Major format version. Files with another major version are ignored.
pub const INDEX_MAJOR_VERSION: u8 = 7;
/// Minor format version. Older minors get upgrade fixups.
pub const INDEX_MINOR_VERSION: u8 = 3;
/// Size of the base header this implementation writes and requires.
pub const INDEX_HEADER_MIN_SIZE: usize = 120;
/// Size of the base message record (`uid`, `flags`, padding).
pub const BASE_RECORD_SIZE: usize = 8;
/// Number of day-first-UID buckets.
pub const DAY_FIRST_UID_COUNT: usize = 8;

/// `compat_flags` bit set by little-endian writers.
pub const COMPAT_LITTLE_ENDIAN: u8 = 0x01;
/// `word_size` written into new headers.
pub const WORD_SIZE: u8 = 8;

/// Byte offsets of header fields, for raw header updates.
pub mod offsets {
    /// `base_header_size` (u16).
    pub const BASE_HEADER_SIZE: usize = 2;
    /// `header_size` (u32).
    pub const HEADER_SIZE: usize = 4;
    /// `record_size` (u32).
    pub const RECORD_SIZE: usize = 8;
    /// `indexid` (u32).
    pub const INDEXID: usize = 16;
    /// `flags` (u32).
    pub const FLAGS: usize = 20;
    /// `uid_validity` (u32).
    pub const UID_VALIDITY: usize = 24;
    /// `next_uid` (u32).
    pub const NEXT_UID: usize = 28;
    /// `messages_count` (u32).
    pub const MESSAGES_COUNT: usize = 32;
    /// `first_recent_uid` (u32).
    pub const FIRST_RECENT_UID: usize = 48;
    /// `log_file_seq` (u32).
    pub const LOG_FILE_SEQ: usize = 60;
    /// `log_file_tail_offset` (u32).
    pub const LOG_FILE_TAIL_OFFSET: usize = 64;
    /// `log_file_head_offset` (u32).
    pub const LOG_FILE_HEAD_OFFSET: usize = 68;
    /// `day_stamp` (u32).
    pub const DAY_STAMP: usize = 84;
    /// `day_first_uid[8]` (u32 each).
    pub const DAY_FIRST_UID: usize = 88;
}

bitflags! {
    /// Index-wide state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u32 {
        /// The index was found corrupted and must be rebuilt.
        const CORRUPTED = 0x01;
        /// Some messages carry the DIRTY flag.
        const HAVE_DIRTY = 0x02;
        /// The index was repaired by fsck.
        const FSCKD = 0x08;
    }
}

/// The decoded base header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    /// Format major version.
    pub major_version: u8,
    /// Format minor version.
    pub minor_version: u8,
    /// Size of the base header; extension headers start after it.
    pub base_header_size: u16,
    /// Size of the whole header including extension headers.
    pub header_size: u32,
    /// Stride of a message record.
    pub record_size: u32,
    /// Endianness marker.
    pub compat_flags: u8,
    /// Word size of the writer.
    pub word_size: u8,
    /// Identifier tying the index to its transaction log.
    pub indexid: u32,
    /// Index-wide state flags.
    pub flags: HeaderFlags,
    /// IMAP UIDVALIDITY; 0 until set.
    pub uid_validity: u32,
    /// UID the next appended message gets.
    pub next_uid: u32,
    /// Number of message records.
    pub messages_count: u32,
    /// Historical recent count, no longer maintained.
    pub unused_old_recent_count: u32,
    /// Messages with `\Seen`.
    pub seen_messages_count: u32,
    /// Messages with `\Deleted`.
    pub deleted_messages_count: u32,
    /// Messages from this UID on are recent.
    pub first_recent_uid: u32,
    /// Every message below this UID is seen.
    pub first_unseen_uid_lowwater: u32,
    /// No message below this UID is deleted.
    pub first_deleted_uid_lowwater: u32,
    /// Log file the index was last synced with.
    pub log_file_seq: u32,
    /// Log offset up to which changes were absorbed by every reader.
    pub log_file_tail_offset: u32,
    /// Log offset the index is synced up to.
    pub log_file_head_offset: u32,
    /// Start of the day `day_first_uid` was last shifted for.
    pub day_stamp: u32,
    /// First UID appended on each of the last eight days.
    pub day_first_uid: [u32; DAY_FIRST_UID_COUNT],
}

impl IndexHeader {
    /// Creates the header of an empty index.
    #[must_use]
    pub fn new(indexid: u32) -> Self {
        Self {
            major_version: INDEX_MAJOR_VERSION,
            minor_version: INDEX_MINOR_VERSION,
            base_header_size: INDEX_HEADER_MIN_SIZE as u16,
            header_size: INDEX_HEADER_MIN_SIZE as u32,
            record_size: BASE_RECORD_SIZE as u32,
            compat_flags: COMPAT_LITTLE_ENDIAN,
            word_size: WORD_SIZE,
            indexid,
            flags: HeaderFlags::empty(),
            uid_validity: 0,
            next_uid: 1,
            messages_count: 0,
            unused_old_recent_count: 0,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            first_recent_uid: 1,
            first_unseen_uid_lowwater: 1,
            first_deleted_uid_lowwater: 1,
            log_file_seq: 0,
            log_file_tail_offset: 0,
            log_file_head_offset: 0,
            day_stamp: 0,
            day_first_uid: [0; DAY_FIRST_UID_COUNT],
        }
    }

    /// Decodes the first [`INDEX_HEADER_MIN_SIZE`] bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns `IndexCorrupted` if `data` is too short.
    pub fn decode(path: &Path, data: &[u8]) -> CoreResult<Self> {
        if data.len() < INDEX_HEADER_MIN_SIZE {
            return Err(CoreError::index_corrupted(
                path,
                format!(
                    "file too small for header: {} < {INDEX_HEADER_MIN_SIZE}",
                    data.len()
                ),
            ));
        }
        let cur = ByteCursor::new(data);
        let mut day_first_uid = [0u32; DAY_FIRST_UID_COUNT];
        for (i, slot) in day_first_uid.iter_mut().enumerate() {
            *slot = cur.read_u32_at(offsets::DAY_FIRST_UID + i * 4)?;
        }
        Ok(Self {
            major_version: cur.read_u8_at(0)?,
            minor_version: cur.read_u8_at(1)?,
            base_header_size: cur.read_u16_at(offsets::BASE_HEADER_SIZE)?,
            header_size: cur.read_u32_at(offsets::HEADER_SIZE)?,
            record_size: cur.read_u32_at(offsets::RECORD_SIZE)?,
            compat_flags: cur.read_u8_at(12)?,
            word_size: cur.read_u8_at(13)?,
            indexid: cur.read_u32_at(offsets::INDEXID)?,
            flags: HeaderFlags::from_bits_retain(cur.read_u32_at(offsets::FLAGS)?),
            uid_validity: cur.read_u32_at(offsets::UID_VALIDITY)?,
            next_uid: cur.read_u32_at(offsets::NEXT_UID)?,
            messages_count: cur.read_u32_at(offsets::MESSAGES_COUNT)?,
            unused_old_recent_count: cur.read_u32_at(36)?,
            seen_messages_count: cur.read_u32_at(40)?,
            deleted_messages_count: cur.read_u32_at(44)?,
            first_recent_uid: cur.read_u32_at(offsets::FIRST_RECENT_UID)?,
            first_unseen_uid_lowwater: cur.read_u32_at(52)?,
            first_deleted_uid_lowwater: cur.read_u32_at(56)?,
            log_file_seq: cur.read_u32_at(offsets::LOG_FILE_SEQ)?,
            log_file_tail_offset: cur.read_u32_at(offsets::LOG_FILE_TAIL_OFFSET)?,
            log_file_head_offset: cur.read_u32_at(offsets::LOG_FILE_HEAD_OFFSET)?,
            day_stamp: cur.read_u32_at(offsets::DAY_STAMP)?,
            day_first_uid,
        })
    }

    /// Writes the header into the first [`INDEX_HEADER_MIN_SIZE`] bytes of
    /// `buf`. Bytes between the base header and `base_header_size` are
    /// left untouched.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let buf = &mut buf[..INDEX_HEADER_MIN_SIZE];
        buf[0] = self.major_version;
        buf[1] = self.minor_version;
        put_u16(buf, offsets::BASE_HEADER_SIZE, self.base_header_size);
        put_u32(buf, offsets::HEADER_SIZE, self.header_size);
        put_u32(buf, offsets::RECORD_SIZE, self.record_size);
        buf[12] = self.compat_flags;
        buf[13] = self.word_size;
        put_u16(buf, 14, 0);
        put_u32(buf, offsets::INDEXID, self.indexid);
        put_u32(buf, offsets::FLAGS, self.flags.bits());
        put_u32(buf, offsets::UID_VALIDITY, self.uid_validity);
        put_u32(buf, offsets::NEXT_UID, self.next_uid);
        put_u32(buf, offsets::MESSAGES_COUNT, self.messages_count);
        put_u32(buf, 36, self.unused_old_recent_count);
        put_u32(buf, 40, self.seen_messages_count);
        put_u32(buf, 44, self.deleted_messages_count);
        put_u32(buf, offsets::FIRST_RECENT_UID, self.first_recent_uid);
        put_u32(buf, 52, self.first_unseen_uid_lowwater);
        put_u32(buf, 56, self.first_deleted_uid_lowwater);
        put_u32(buf, offsets::LOG_FILE_SEQ, self.log_file_seq);
        put_u32(buf, offsets::LOG_FILE_TAIL_OFFSET, self.log_file_tail_offset);
        put_u32(buf, offsets::LOG_FILE_HEAD_OFFSET, self.log_file_head_offset);
        buf[72..84].fill(0);
        put_u32(buf, offsets::DAY_STAMP, self.day_stamp);
        for (i, uid) in self.day_first_uid.iter().enumerate() {
            put_u32(buf, offsets::DAY_FIRST_UID + i * 4, *uid);
        }
    }

    /// Encodes the base header as a standalone buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; INDEX_HEADER_MIN_SIZE];
        self.encode_into(&mut buf);
        buf
    }
}

/// Returns true if a header can be used with this implementation and a file
/// of `file_size` bytes.
///
/// A different major version is silently not applicable. Foreign
/// endianness or word size, and header sizes that contradict each other or
/// the file, are reported and make the header unusable; the caller rebuilds
/// the index from the log.
#[must_use]
pub fn check_header_compat(path: &Path, hdr: &IndexHeader, file_size: u64) -> bool {
    if hdr.major_version != INDEX_MAJOR_VERSION {
        return false;
    }
    if hdr.compat_flags != COMPAT_LITTLE_ENDIAN || hdr.word_size != WORD_SIZE {
        tracing::warn!(
            path = %path.display(),
            compat_flags = hdr.compat_flags,
            word_size = hdr.word_size,
            "index written on a different architecture, rebuilding"
        );
        return false;
    }
    if usize::from(hdr.base_header_size) < INDEX_HEADER_MIN_SIZE
        || hdr.header_size < u32::from(hdr.base_header_size)
    {
        tracing::error!(
            path = %path.display(),
            base_header_size = hdr.base_header_size,
            header_size = hdr.header_size,
            "corrupted header sizes"
        );
        return false;
    }
    if u64::from(hdr.header_size) > file_size {
        tracing::error!(
            path = %path.display(),
            header_size = hdr.header_size,
            file_size,
            "header size exceeds file size"
        );
        return false;
    }
    if (hdr.record_size as usize) < BASE_RECORD_SIZE {
        tracing::error!(path = %path.display(), record_size = hdr.record_size, "record size too small");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> &'static Path {
        Path::new("test.index")
    }

    #[test]
    fn new_header_layout() {
        let mut hdr = IndexHeader::new(0x1234_5678);
        hdr.next_uid = 102;
        hdr.log_file_tail_offset = 0xdead;
        hdr.day_first_uid[7] = 9;
        let buf = hdr.encode();

        assert_eq!(buf.len(), INDEX_HEADER_MIN_SIZE);
        assert_eq!(buf[0], 7);
        assert_eq!(buf[1], 3);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 120);
        assert_eq!(buf[12], COMPAT_LITTLE_ENDIAN);
        assert_eq!(&buf[16..20], &0x1234_5678u32.to_le_bytes());
        assert_eq!(&buf[28..32], &102u32.to_le_bytes());
        assert_eq!(&buf[64..68], &0xdeadu32.to_le_bytes());
        assert_eq!(&buf[116..120], &9u32.to_le_bytes());

        assert_eq!(IndexHeader::decode(path(), &buf).unwrap(), hdr);
    }

    #[test]
    fn short_buffer_is_corruption() {
        let err = IndexHeader::decode(path(), &[0u8; 64]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn compat_checks() {
        let hdr = IndexHeader::new(1);
        assert!(check_header_compat(path(), &hdr, 120));

        let mut other = hdr.clone();
        other.major_version = 6;
        assert!(!check_header_compat(path(), &other, 120));

        let mut other = hdr.clone();
        other.compat_flags = 0;
        assert!(!check_header_compat(path(), &other, 120));

        let mut other = hdr.clone();
        other.word_size = 4;
        assert!(!check_header_compat(path(), &other, 120));

        let mut other = hdr.clone();
        other.base_header_size = 100;
        assert!(!check_header_compat(path(), &other, 120));

        let mut other = hdr.clone();
        other.header_size = 200;
        assert!(!check_header_compat(path(), &other, 199));
        assert!(check_header_compat(path(), &other, 200));
    }
}
