//! Record payload codecs.
//!
//! Encoders produce the payload that follows a record header; decoders
//! validate sizes and structure and report violations as `LogCorrupted`
//! with the record's file, offset and type.

use crate::cursor::{pad_to, ByteCursor};
use crate::error::{CoreError, CoreResult};
use crate::log::format::RecordKind;
use crate::types::{align_up, Guid, MailFlags, ModifyType, Modseq, Uid};
use std::path::Path;

/// An inclusive UID range.
pub type UidRange = (Uid, Uid);

/// `ext_id` value of an intro that names its extension.
pub const EXT_ID_BY_NAME: u32 = u32::MAX;
/// Intro flag: never shrink the extension's sizes.
pub const EXT_INTRO_NO_SHRINK: u16 = 0x01;

/// Where a record came from, for corruption reports.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    /// Log file path.
    pub path: &'a Path,
    /// Offset of the record header.
    pub offset: u64,
    /// Raw type bits.
    pub raw_type: u32,
}

impl RecordContext<'_> {
    /// Builds a corruption error for this record.
    pub fn corrupt(&self, message: impl Into<String>) -> CoreError {
        CoreError::log_corrupted(self.path, self.offset, self.raw_type, message)
    }

    fn check_stride(&self, data: &[u8], stride: usize, what: &str) -> CoreResult<()> {
        if data.len() % stride != 0 {
            return Err(self.corrupt(format!(
                "{what} payload of {} bytes is not a multiple of {stride}",
                data.len()
            )));
        }
        Ok(())
    }
}

/// Encodes UID ranges.
pub fn encode_uid_ranges(buf: &mut Vec<u8>, ranges: &[UidRange]) {
    for &(uid1, uid2) in ranges {
        buf.extend_from_slice(&uid1.to_le_bytes());
        buf.extend_from_slice(&uid2.to_le_bytes());
    }
}

/// Decodes UID ranges, requiring nonzero, ordered, non-overlapping,
/// strictly increasing ranges.
pub fn decode_uid_ranges(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<Vec<UidRange>> {
    ctx.check_stride(data, 8, "uid range")?;
    let cur = ByteCursor::new(data);
    let mut ranges = Vec::with_capacity(data.len() / 8);
    let mut prev = 0u32;
    for i in 0..data.len() / 8 {
        let uid1 = cur.read_u32_at(i * 8)?;
        let uid2 = cur.read_u32_at(i * 8 + 4)?;
        check_range(ctx, uid1, uid2, &mut prev)?;
        ranges.push((uid1, uid2));
    }
    Ok(ranges)
}

fn check_range(ctx: &RecordContext<'_>, uid1: Uid, uid2: Uid, prev: &mut Uid) -> CoreResult<()> {
    if uid1 == 0 || uid1 > uid2 || (*prev != 0 && uid1 <= *prev) {
        return Err(ctx.corrupt(format!(
            "invalid uid range {uid1}..{uid2} after {prev}"
        )));
    }
    *prev = uid2;
    Ok(())
}

/// One appended message in an APPEND record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendRecord {
    /// Assigned UID.
    pub uid: Uid,
    /// Initial flags.
    pub flags: MailFlags,
}

impl AppendRecord {
    /// Encoded size.
    pub const SIZE: usize = 8;

    /// Encodes the record.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&[self.flags.bits(), 0, 0, 0]);
    }

    /// Decodes every record in an APPEND payload.
    pub fn decode_all(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<Vec<Self>> {
        ctx.check_stride(data, Self::SIZE, "append")?;
        let cur = ByteCursor::new(data);
        (0..data.len() / Self::SIZE)
            .map(|i| {
                Ok(Self {
                    uid: cur.read_u32_at(i * Self::SIZE)?,
                    flags: MailFlags::from_bits_retain(cur.read_u8_at(i * Self::SIZE + 4)?),
                })
            })
            .collect()
    }
}

/// A flag change over a UID range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagUpdate {
    /// First UID.
    pub uid1: Uid,
    /// Last UID.
    pub uid2: Uid,
    /// Flags to set.
    pub add: MailFlags,
    /// Flags to clear.
    pub remove: MailFlags,
    /// The change bumps the messages' modseqs even if no flag changes.
    pub modseq_inc: bool,
}

impl FlagUpdate {
    /// Encoded size.
    pub const SIZE: usize = 12;

    /// Encodes the update.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.uid1.to_le_bytes());
        buf.extend_from_slice(&self.uid2.to_le_bytes());
        buf.extend_from_slice(&[
            self.add.bits(),
            self.remove.bits(),
            u8::from(self.modseq_inc),
            0,
        ]);
    }

    /// Decodes every update in a FLAG_UPDATE payload.
    pub fn decode_all(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<Vec<Self>> {
        ctx.check_stride(data, Self::SIZE, "flag update")?;
        let cur = ByteCursor::new(data);
        let mut prev = 0;
        let mut updates = Vec::with_capacity(data.len() / Self::SIZE);
        for i in 0..data.len() / Self::SIZE {
            let at = i * Self::SIZE;
            let update = Self {
                uid1: cur.read_u32_at(at)?,
                uid2: cur.read_u32_at(at + 4)?,
                add: MailFlags::from_bits_retain(cur.read_u8_at(at + 8)?),
                remove: MailFlags::from_bits_retain(cur.read_u8_at(at + 9)?),
                modseq_inc: cur.read_u8_at(at + 10)? != 0,
            };
            check_range(ctx, update.uid1, update.uid2, &mut prev)?;
            updates.push(update);
        }
        Ok(updates)
    }
}

/// A single-message expunge carrying the message GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpungeGuid {
    /// Expunged UID.
    pub uid: Uid,
    /// GUID of the expunged message.
    pub guid: Guid,
}

impl ExpungeGuid {
    /// Encoded size.
    pub const SIZE: usize = 20;

    /// Encodes the expunge.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.guid);
    }

    /// Decodes every expunge in an EXPUNGE_GUID payload.
    pub fn decode_all(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<Vec<Self>> {
        ctx.check_stride(data, Self::SIZE, "expunge guid")?;
        let cur = ByteCursor::new(data);
        (0..data.len() / Self::SIZE)
            .map(|i| {
                let uid = cur.read_u32_at(i * Self::SIZE)?;
                if uid == 0 {
                    return Err(ctx.corrupt("expunge guid with uid 0"));
                }
                Ok(Self {
                    uid,
                    guid: cur.read_guid_at(i * Self::SIZE + 4)?,
                })
            })
            .collect()
    }
}

/// Encodes one `{offset u16, size u16, data, pad4}` patch, as used by
/// header and extension header updates.
pub fn encode_patch(buf: &mut Vec<u8>, offset: u16, data: &[u8]) {
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
    buf.extend_from_slice(data);
    pad_to(buf, 4);
}

/// Decodes a sequence of patches.
pub fn decode_patches<'a>(
    ctx: &RecordContext<'_>,
    data: &'a [u8],
) -> CoreResult<Vec<(u16, &'a [u8])>> {
    let cur = ByteCursor::new(data);
    let mut patches = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (offset, size) = match (cur.read_u16_at(pos), cur.read_u16_at(pos + 2)) {
            (Ok(offset), Ok(size)) => (offset, usize::from(size)),
            _ => return Err(ctx.corrupt(format!("truncated header update at {pos}"))),
        };
        let body = cur.slice_at(pos + 4, size).map_err(|_| {
            ctx.corrupt(format!(
                "header update of {size} bytes at {pos} overruns {}-byte payload",
                data.len()
            ))
        })?;
        patches.push((offset, body));
        pos = align_up(pos + 4 + size, 4);
    }
    Ok(patches)
}

/// Selects an extension for the records that follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtIntro {
    /// Position in the writer's map, or [`EXT_ID_BY_NAME`].
    pub ext_id: u32,
    /// Header data size.
    pub hdr_size: u32,
    /// Record area size.
    pub record_size: u16,
    /// Record area alignment.
    pub record_align: u16,
    /// `EXT_INTRO_*` flags.
    pub flags: u16,
    /// Extension name; empty when `ext_id` refers to an existing one.
    pub name: String,
}

impl ExtIntro {
    const FIXED_SIZE: usize = 16;

    /// Encodes the intro.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ext_id.to_le_bytes());
        buf.extend_from_slice(&self.hdr_size.to_le_bytes());
        buf.extend_from_slice(&self.record_size.to_le_bytes());
        buf.extend_from_slice(&self.record_align.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        pad_to(buf, 4);
    }

    /// Decodes an EXT_INTRO payload.
    pub fn decode(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<Self> {
        let cur = ByteCursor::new(data);
        if data.len() < Self::FIXED_SIZE {
            return Err(ctx.corrupt(format!(
                "extension intro of {} bytes < {}",
                data.len(),
                Self::FIXED_SIZE
            )));
        }
        let name_size = usize::from(cur.read_u16_at(14)?);
        let name = cur
            .slice_at(Self::FIXED_SIZE, name_size)
            .map_err(|_| ctx.corrupt(format!("extension intro name_size {name_size} overruns record")))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| ctx.corrupt("extension name is not UTF-8"))?
            .to_string();
        let intro = Self {
            ext_id: cur.read_u32_at(0)?,
            hdr_size: cur.read_u32_at(4)?,
            record_size: cur.read_u16_at(8)?,
            record_align: cur.read_u16_at(10)?,
            flags: cur.read_u16_at(12)?,
            name,
        };
        if intro.ext_id == EXT_ID_BY_NAME && intro.name.is_empty() {
            return Err(ctx.corrupt("extension intro without id or name"));
        }
        if intro.record_size > 0 && !matches!(intro.record_align, 1 | 2 | 4 | 8) {
            return Err(ctx.corrupt(format!(
                "extension {:?} has invalid alignment {}",
                intro.name, intro.record_align
            )));
        }
        Ok(intro)
    }

    /// Returns true if the extension must not shrink.
    #[must_use]
    pub fn no_shrink(&self) -> bool {
        self.flags & EXT_INTRO_NO_SHRINK != 0
    }
}

/// Encodes an EXT_RESET payload.
pub fn encode_ext_reset(buf: &mut Vec<u8>, preserve_data: bool) {
    buf.extend_from_slice(&u32::from(preserve_data).to_le_bytes());
}

/// Decodes an EXT_RESET payload, returning `preserve_data`.
pub fn decode_ext_reset(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<bool> {
    if data.len() != 4 {
        return Err(ctx.corrupt(format!("extension reset of {} bytes != 4", data.len())));
    }
    Ok(ByteCursor::new(data).read_u32_at(0)? != 0)
}

/// Encodes one `{uid, data, pad4}` extension record update.
pub fn encode_ext_rec_update(buf: &mut Vec<u8>, uid: Uid, data: &[u8]) {
    buf.extend_from_slice(&uid.to_le_bytes());
    buf.extend_from_slice(data);
    pad_to(buf, 4);
}

/// Decodes extension record updates for an extension with `record_size`
/// byte records.
pub fn decode_ext_rec_updates<'a>(
    ctx: &RecordContext<'_>,
    data: &'a [u8],
    record_size: usize,
) -> CoreResult<Vec<(Uid, &'a [u8])>> {
    let stride = align_up(4 + record_size, 4);
    ctx.check_stride(data, stride, "extension record update")?;
    let cur = ByteCursor::new(data);
    (0..data.len() / stride)
        .map(|i| {
            let at = i * stride;
            let uid = cur.read_u32_at(at)?;
            if uid == 0 {
                return Err(ctx.corrupt("extension record update with uid 0"));
            }
            Ok((uid, cur.slice_at(at + 4, record_size)?))
        })
        .collect()
}

/// Adds or removes one keyword over UID ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordUpdate {
    /// [`ModifyType::Add`] or [`ModifyType::Remove`].
    pub modify: ModifyType,
    /// Keyword name.
    pub name: String,
    /// Affected UIDs.
    pub ranges: Vec<UidRange>,
}

impl KeywordUpdate {
    /// Encodes the update.
    ///
    /// # Panics
    ///
    /// Panics for [`ModifyType::Replace`], which is staged as a reset plus
    /// an add.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let modify = match self.modify {
            ModifyType::Add => 1u8,
            ModifyType::Remove => 2u8,
            ModifyType::Replace => panic!("keyword replace is not a log operation"),
        };
        buf.extend_from_slice(&[modify, 0]);
        buf.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        pad_to(buf, 4);
        encode_uid_ranges(buf, &self.ranges);
    }

    /// Decodes a KEYWORD_UPDATE payload.
    pub fn decode(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<Self> {
        let cur = ByteCursor::new(data);
        if data.len() < 4 {
            return Err(ctx.corrupt("keyword update shorter than its header"));
        }
        let modify = match cur.read_u8_at(0)? {
            1 => ModifyType::Add,
            2 => ModifyType::Remove,
            other => return Err(ctx.corrupt(format!("invalid keyword modify type {other}"))),
        };
        let name_size = usize::from(cur.read_u16_at(2)?);
        if name_size == 0 {
            return Err(ctx.corrupt("keyword update with empty name"));
        }
        let name = cur
            .slice_at(4, name_size)
            .map_err(|_| ctx.corrupt(format!("keyword name_size {name_size} overruns record")))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| ctx.corrupt("keyword name is not UTF-8"))?
            .to_string();
        let ranges_start = align_up(4 + name_size, 4);
        let ranges = decode_uid_ranges(ctx, data.get(ranges_start..).unwrap_or_default())?;
        Ok(Self {
            modify,
            name,
            ranges,
        })
    }
}

/// Adds a signed amount to a counter in an extension record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtAtomicInc {
    /// Target UID.
    pub uid: Uid,
    /// Amount to add.
    pub diff: i32,
}

impl ExtAtomicInc {
    /// Encoded size.
    pub const SIZE: usize = 8;

    /// Encodes the increment.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.diff.to_le_bytes());
    }

    /// Decodes every increment in an EXT_ATOMIC_INC payload.
    pub fn decode_all(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<Vec<Self>> {
        ctx.check_stride(data, Self::SIZE, "atomic increment")?;
        let cur = ByteCursor::new(data);
        (0..data.len() / Self::SIZE)
            .map(|i| {
                Ok(Self {
                    uid: cur.read_u32_at(i * Self::SIZE)?,
                    diff: cur.read_i32_at(i * Self::SIZE + 4)?,
                })
            })
            .collect()
    }
}

/// Raises one message's modseq.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModseqUpdate {
    /// Target UID; 0 updates only the highest modseq.
    pub uid: Uid,
    /// New minimum modseq.
    pub modseq: Modseq,
}

impl ModseqUpdate {
    /// Encoded size.
    pub const SIZE: usize = 12;

    /// Encodes the update.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&(self.modseq as u32).to_le_bytes());
        buf.extend_from_slice(&((self.modseq >> 32) as u32).to_le_bytes());
    }

    /// Decodes every update in a MODSEQ_UPDATE payload.
    pub fn decode_all(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<Vec<Self>> {
        ctx.check_stride(data, Self::SIZE, "modseq update")?;
        let cur = ByteCursor::new(data);
        (0..data.len() / Self::SIZE)
            .map(|i| {
                let at = i * Self::SIZE;
                let low = u64::from(cur.read_u32_at(at + 4)?);
                let high = u64::from(cur.read_u32_at(at + 8)?);
                Ok(Self {
                    uid: cur.read_u32_at(at)?,
                    modseq: (high << 32) | low,
                })
            })
            .collect()
    }
}

/// Decodes a BOUNDARY payload, returning the transaction length.
pub fn decode_boundary(ctx: &RecordContext<'_>, data: &[u8]) -> CoreResult<u32> {
    if data.len() != 4 {
        return Err(ctx.corrupt(format!("boundary of {} bytes != 4", data.len())));
    }
    Ok(ByteCursor::new(data).read_u32_at(0)?)
}

/// Returns the modseq after a record of `kind` whose predecessor left
/// the log at `prev`.
///
/// Every record that changes messages bumps the modseq by one; a
/// MODSEQ_UPDATE raises it to the highest value it carries.
///
/// # Errors
///
/// Returns `LogCorrupted` if a MODSEQ_UPDATE payload is malformed.
pub fn modseq_after(
    ctx: &RecordContext<'_>,
    kind: RecordKind,
    data: &[u8],
    prev: Modseq,
) -> CoreResult<Modseq> {
    Ok(match kind {
        RecordKind::Append
        | RecordKind::Expunge
        | RecordKind::ExpungeGuid
        | RecordKind::FlagUpdate
        | RecordKind::KeywordUpdate
        | RecordKind::KeywordReset
        | RecordKind::ExtRecUpdate
        | RecordKind::ExtAtomicInc => prev + 1,
        RecordKind::ModseqUpdate => ModseqUpdate::decode_all(ctx, data)?
            .iter()
            .map(|update| update.modseq)
            .fold(prev, Modseq::max),
        _ => prev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RecordContext<'static> {
        RecordContext {
            path: Path::new("t.log"),
            offset: 40,
            raw_type: 0x4,
        }
    }

    #[test]
    fn uid_ranges_must_increase() {
        let mut buf = Vec::new();
        encode_uid_ranges(&mut buf, &[(1, 3), (5, 5)]);
        assert_eq!(decode_uid_ranges(&ctx(), &buf).unwrap(), vec![(1, 3), (5, 5)]);

        for bad in [&[(0, 1)][..], &[(3, 2)], &[(1, 5), (5, 6)], &[(4, 5), (1, 2)]] {
            let mut buf = Vec::new();
            encode_uid_ranges(&mut buf, bad);
            assert!(decode_uid_ranges(&ctx(), &buf).unwrap_err().is_corruption());
        }
        assert!(decode_uid_ranges(&ctx(), &[0; 12]).is_err());
    }

    #[test]
    fn flag_update_layout() {
        let update = FlagUpdate {
            uid1: 1,
            uid2: 2,
            add: MailFlags::SEEN,
            remove: MailFlags::DRAFT,
            modseq_inc: true,
        };
        let mut buf = Vec::new();
        update.encode(&mut buf);
        assert_eq!(buf, [1, 0, 0, 0, 2, 0, 0, 0, 0x08, 0x10, 1, 0]);
        assert_eq!(FlagUpdate::decode_all(&ctx(), &buf).unwrap(), vec![update]);
    }

    #[test]
    fn patches_are_padded() {
        let mut buf = Vec::new();
        encode_patch(&mut buf, 64, &[1, 2, 3, 4, 5]);
        encode_patch(&mut buf, 24, &[9]);
        assert_eq!(buf.len(), 12 + 8);
        let patches = decode_patches(&ctx(), &buf).unwrap();
        assert_eq!(patches, vec![(64, &[1, 2, 3, 4, 5][..]), (24, &[9][..])]);

        buf.truncate(14);
        assert!(decode_patches(&ctx(), &buf).is_err());
    }

    #[test]
    fn ext_intro_with_name() {
        let intro = ExtIntro {
            ext_id: EXT_ID_BY_NAME,
            hdr_size: 16,
            record_size: 4,
            record_align: 4,
            flags: EXT_INTRO_NO_SHRINK,
            name: "cache".to_string(),
        };
        let mut buf = Vec::new();
        intro.encode(&mut buf);
        assert_eq!(buf.len(), 24);
        let decoded = ExtIntro::decode(&ctx(), &buf).unwrap();
        assert_eq!(decoded, intro);
        assert!(decoded.no_shrink());

        buf[14] = 200;
        assert!(ExtIntro::decode(&ctx(), &buf).is_err());
    }

    #[test]
    fn keyword_update_layout() {
        let update = KeywordUpdate {
            modify: ModifyType::Remove,
            name: "$Junk".to_string(),
            ranges: vec![(2, 4)],
        };
        let mut buf = Vec::new();
        update.encode(&mut buf);
        assert_eq!(&buf[..4], &[2, 0, 5, 0]);
        assert_eq!(buf.len(), 4 + 8 + 8);
        assert_eq!(KeywordUpdate::decode(&ctx(), &buf).unwrap(), update);

        buf[0] = 3;
        assert!(KeywordUpdate::decode(&ctx(), &buf).is_err());
    }

    #[test]
    fn ext_rec_updates_use_padded_stride() {
        let mut buf = Vec::new();
        encode_ext_rec_update(&mut buf, 7, &[1, 2]);
        encode_ext_rec_update(&mut buf, 8, &[3, 4]);
        assert_eq!(buf.len(), 16);
        let updates = decode_ext_rec_updates(&ctx(), &buf, 2).unwrap();
        assert_eq!(updates, vec![(7, &[1, 2][..]), (8, &[3, 4][..])]);
        assert!(decode_ext_rec_updates(&ctx(), &buf, 6).is_err());
    }

    #[test]
    fn modseq_splits_into_halves() {
        let update = ModseqUpdate {
            uid: 3,
            modseq: 0x1_0000_0002,
        };
        let mut buf = Vec::new();
        update.encode(&mut buf);
        assert_eq!(&buf[4..8], &2u32.to_le_bytes());
        assert_eq!(&buf[8..12], &1u32.to_le_bytes());
        assert_eq!(ModseqUpdate::decode_all(&ctx(), &buf).unwrap(), vec![update]);
    }

    #[test]
    fn expunge_guid_rejects_uid_zero() {
        let mut buf = Vec::new();
        ExpungeGuid { uid: 0, guid: [1; 16] }.encode(&mut buf);
        assert!(ExpungeGuid::decode_all(&ctx(), &buf).is_err());
    }
}
