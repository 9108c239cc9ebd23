//! Transaction log file and record headers.
//!
//! ```text
//! file:    [file header (hdr_size bytes)] [record]*
//! record:  [type u32] [size: 4 encoded bytes] [payload, padded to 4]
//! ```
//!
//! A record's size counts its 8-byte header. The size is stored so that
//! every byte has its high bit set; a size that is still zero was never
//! patched in and marks the end of the durable part of the file.

use crate::cursor::{put_u32, put_u64, ByteCursor};
use crate::error::{CoreError, CoreResult};
use bitflags::bitflags;
use std::path::Path;

/// Log format major version.
pub const LOG_MAJOR_VERSION: u8 = 1;
/// Log format minor version.
pub const LOG_MINOR_VERSION: u8 = 3;
/// Size of the file header written by this implementation.
pub const LOG_FILE_HEADER_SIZE: usize = 40;
/// Size of a record header.
pub const RECORD_HEADER_SIZE: usize = 8;
/// Largest encodable record size.
pub const MAX_RECORD_SIZE: u32 = 0x0fff_ffff;
/// `compat_flags` bit set by little-endian writers.
pub const LOG_COMPAT_LITTLE_ENDIAN: u8 = 0x01;

bitflags! {
    /// Raw record type bits: one record kind plus modifier flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordType: u32 {
        /// See [`RecordKind::Expunge`].
        const EXPUNGE = 0x0000_0001;
        /// See [`RecordKind::Append`].
        const APPEND = 0x0000_0002;
        /// See [`RecordKind::FlagUpdate`].
        const FLAG_UPDATE = 0x0000_0004;
        /// See [`RecordKind::HeaderUpdate`].
        const HEADER_UPDATE = 0x0000_0020;
        /// See [`RecordKind::ExtIntro`].
        const EXT_INTRO = 0x0000_0040;
        /// See [`RecordKind::ExtReset`].
        const EXT_RESET = 0x0000_0080;
        /// See [`RecordKind::ExtHdrUpdate`].
        const EXT_HDR_UPDATE = 0x0000_0100;
        /// See [`RecordKind::ExtRecUpdate`].
        const EXT_REC_UPDATE = 0x0000_0200;
        /// See [`RecordKind::KeywordUpdate`].
        const KEYWORD_UPDATE = 0x0000_0400;
        /// See [`RecordKind::KeywordReset`].
        const KEYWORD_RESET = 0x0000_0800;
        /// See [`RecordKind::ExtAtomicInc`].
        const EXT_ATOMIC_INC = 0x0000_1000;
        /// See [`RecordKind::ExpungeGuid`].
        const EXPUNGE_GUID = 0x0000_2000;
        /// See [`RecordKind::ModseqUpdate`].
        const MODSEQ_UPDATE = 0x0000_8000;
        /// See [`RecordKind::Boundary`].
        const BOUNDARY = 0x0008_0000;

        /// Bits holding the record kind.
        const TYPE_MASK = 0x0fff_ffff;
        /// Must be fully present on every expunge record.
        const EXPUNGE_PROT = 0x0000_cd90;
        /// The change was made outside the index's own sync (e.g. by a
        /// mailbox backend) rather than by a client.
        const EXTERNAL = 0x1000_0000;
        /// Written while syncing the index with its backend.
        const SYNC = 0x2000_0000;
    }
}

impl RecordType {
    /// Strips the expunge protection mask from raw type bits.
    ///
    /// Returns `None` if an expunge kind is set without the full mask.
    #[must_use]
    pub fn strip_protection(raw: u32) -> Option<Self> {
        let ty = Self::from_bits_retain(raw);
        if ty.intersects(Self::EXPUNGE | Self::EXPUNGE_GUID) {
            ty.contains(Self::EXPUNGE_PROT)
                .then(|| ty - Self::EXPUNGE_PROT)
        } else {
            Some(ty)
        }
    }

    /// Returns the record kind with modifier flags removed.
    #[must_use]
    pub fn kind(self) -> Option<RecordKind> {
        RecordKind::from_u32((self & Self::TYPE_MASK).bits())
    }

    /// Returns true for records made outside the index's own sync.
    #[must_use]
    pub fn is_external(self) -> bool {
        self.contains(Self::EXTERNAL)
    }
}

/// The kind of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordKind {
    /// UID ranges removed.
    Expunge = 0x0001,
    /// New message records.
    Append = 0x0002,
    /// Flag changes over UID ranges.
    FlagUpdate = 0x0004,
    /// Raw base-header patches.
    HeaderUpdate = 0x0020,
    /// Selects (and if needed creates or resizes) an extension for the
    /// records that follow.
    ExtIntro = 0x0040,
    /// Clears the selected extension.
    ExtReset = 0x0080,
    /// Patches the selected extension's header.
    ExtHdrUpdate = 0x0100,
    /// Sets the selected extension's record data.
    ExtRecUpdate = 0x0200,
    /// Adds or removes one keyword over UID ranges.
    KeywordUpdate = 0x0400,
    /// Clears all keywords over UID ranges.
    KeywordReset = 0x0800,
    /// Adds to a counter in the selected extension's record data.
    ExtAtomicInc = 0x1000,
    /// Single-UID expunges carrying a GUID.
    ExpungeGuid = 0x2000,
    /// Raises per-message modseqs.
    ModseqUpdate = 0x8000,
    /// Marks the start of a transaction and its total length.
    Boundary = 0x8_0000,
}

impl RecordKind {
    /// Converts a masked type value to a kind.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x0001 => Self::Expunge,
            0x0002 => Self::Append,
            0x0004 => Self::FlagUpdate,
            0x0020 => Self::HeaderUpdate,
            0x0040 => Self::ExtIntro,
            0x0080 => Self::ExtReset,
            0x0100 => Self::ExtHdrUpdate,
            0x0200 => Self::ExtRecUpdate,
            0x0400 => Self::KeywordUpdate,
            0x0800 => Self::KeywordReset,
            0x1000 => Self::ExtAtomicInc,
            0x2000 => Self::ExpungeGuid,
            0x8000 => Self::ModseqUpdate,
            0x8_0000 => Self::Boundary,
            _ => return None,
        })
    }

    /// Returns the type bits written for this kind, including the expunge
    /// protection mask where required.
    #[must_use]
    pub const fn type_bits(self) -> u32 {
        let bits = self as u32;
        if self.is_expunge() {
            bits | RecordType::EXPUNGE_PROT.bits()
        } else {
            bits
        }
    }

    /// Returns true for the kinds that must carry the protection mask.
    #[must_use]
    pub const fn is_expunge(self) -> bool {
        matches!(self, Self::Expunge | Self::ExpungeGuid)
    }
}

/// A decoded record header, as handed to log view callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Type bits with the expunge protection mask removed.
    pub record_type: RecordType,
    /// Total record size including this header and padding.
    pub size: u32,
}

impl RecordHeader {
    /// Returns the record kind.
    #[must_use]
    pub fn kind(&self) -> Option<RecordKind> {
        self.record_type.kind()
    }
}

/// Encodes a record size so that no stored byte is zero.
///
/// # Panics
///
/// Panics if `size` exceeds [`MAX_RECORD_SIZE`].
#[must_use]
pub fn encode_size(size: u32) -> [u8; 4] {
    assert!(size <= MAX_RECORD_SIZE, "record size {size} too large");
    [
        0x80 | ((size >> 21) & 0x7f) as u8,
        0x80 | ((size >> 14) & 0x7f) as u8,
        0x80 | ((size >> 7) & 0x7f) as u8,
        0x80 | (size & 0x7f) as u8,
    ]
}

/// Decodes a stored record size. Returns 0 unless every byte carries the
/// high bit, i.e. for a size that was never (or only partly) written.
#[must_use]
pub fn decode_size(bytes: [u8; 4]) -> u32 {
    if bytes.iter().any(|&b| b & 0x80 == 0) {
        return 0;
    }
    (u32::from(bytes[0] & 0x7f) << 21)
        | (u32::from(bytes[1] & 0x7f) << 14)
        | (u32::from(bytes[2] & 0x7f) << 7)
        | u32::from(bytes[3] & 0x7f)
}

/// The header at the start of every log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFileHeader {
    /// Sequence number of this file.
    pub file_seq: u32,
    /// Sequence of the file this one continues, 0 if the index was reset.
    pub prev_file_seq: u32,
    /// Offset in the previous file where this file takes over.
    pub prev_file_offset: u64,
    /// Size of this header; records start here.
    pub hdr_size: u32,
    /// Must match the index's `indexid`.
    pub indexid: u32,
    /// Format major version.
    pub major_version: u8,
    /// Format minor version.
    pub minor_version: u8,
    /// Endianness marker.
    pub compat_flags: u8,
    /// Creation time in seconds since the epoch.
    pub create_stamp: u32,
    /// Modseq in effect at the start of the file.
    pub initial_modseq: u64,
}

impl LogFileHeader {
    /// Creates the header of a new log file.
    #[must_use]
    pub fn new(indexid: u32, file_seq: u32, prev_file_seq: u32, prev_file_offset: u64) -> Self {
        Self {
            file_seq,
            prev_file_seq,
            prev_file_offset,
            hdr_size: LOG_FILE_HEADER_SIZE as u32,
            indexid,
            major_version: LOG_MAJOR_VERSION,
            minor_version: LOG_MINOR_VERSION,
            compat_flags: LOG_COMPAT_LITTLE_ENDIAN,
            create_stamp: crate::types::unix_now(),
            initial_modseq: 0,
        }
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; LOG_FILE_HEADER_SIZE];
        put_u32(&mut buf, 0, self.file_seq);
        put_u32(&mut buf, 4, self.prev_file_seq);
        put_u64(&mut buf, 8, self.prev_file_offset);
        put_u32(&mut buf, 16, self.hdr_size);
        put_u32(&mut buf, 20, self.indexid);
        buf[24] = self.major_version;
        buf[25] = self.minor_version;
        buf[26] = self.compat_flags;
        put_u32(&mut buf, 28, self.create_stamp);
        put_u64(&mut buf, 32, self.initial_modseq);
        buf
    }

    /// Decodes and validates a file header.
    ///
    /// # Errors
    ///
    /// Returns `LogCorrupted` if the data is too short, the major version
    /// is foreign, or `hdr_size`, `file_seq` or `indexid` are invalid.
    pub fn decode(path: &Path, data: &[u8]) -> CoreResult<Self> {
        let corrupt = |message: String| CoreError::log_corrupted(path, 0, 0, message);
        if data.len() < LOG_FILE_HEADER_SIZE {
            return Err(corrupt(format!(
                "file header truncated: {} < {LOG_FILE_HEADER_SIZE} bytes",
                data.len()
            )));
        }
        let cur = ByteCursor::new(data);
        let hdr = Self {
            file_seq: cur.read_u32_at(0)?,
            prev_file_seq: cur.read_u32_at(4)?,
            prev_file_offset: cur.read_u64_at(8)?,
            hdr_size: cur.read_u32_at(16)?,
            indexid: cur.read_u32_at(20)?,
            major_version: cur.read_u8_at(24)?,
            minor_version: cur.read_u8_at(25)?,
            compat_flags: cur.read_u8_at(26)?,
            create_stamp: cur.read_u32_at(28)?,
            initial_modseq: cur.read_u64_at(32)?,
        };
        if hdr.major_version != LOG_MAJOR_VERSION {
            return Err(corrupt(format!(
                "incompatible major version {}",
                hdr.major_version
            )));
        }
        if (hdr.hdr_size as usize) < LOG_FILE_HEADER_SIZE || hdr.hdr_size as usize > data.len() {
            return Err(corrupt(format!("invalid hdr_size {}", hdr.hdr_size)));
        }
        if hdr.compat_flags != LOG_COMPAT_LITTLE_ENDIAN {
            return Err(corrupt(format!(
                "written on a different architecture (compat {:#x})",
                hdr.compat_flags
            )));
        }
        if hdr.file_seq == 0 {
            return Err(corrupt("file_seq is 0".to_string()));
        }
        if hdr.indexid == 0 {
            return Err(corrupt("indexid is 0".to_string()));
        }
        Ok(hdr)
    }
}

/// Appends a record header with a zero size to `buf`, returning the
/// record's start offset within `buf`.
pub fn begin_record(buf: &mut Vec<u8>, type_bits: u32) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&type_bits.to_le_bytes());
    buf.extend_from_slice(&[0; 4]);
    start
}

/// Pads the record that starts at `start` to 4 bytes and stores its
/// encoded size.
pub fn finish_record(buf: &mut Vec<u8>, start: usize) {
    crate::cursor::pad_to(buf, 4);
    let size = (buf.len() - start) as u32;
    buf[start + 4..start + 8].copy_from_slice(&encode_size(size));
}
