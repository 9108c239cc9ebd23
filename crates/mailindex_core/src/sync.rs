//! Replaying the transaction log into index maps.
//!
//! Maps are never changed in place: [`replay`] applies the records of a
//! [`LogView`] to a copy of a map and returns the copy, which then replaces
//! the old map wholesale.

use crate::error::{CoreError, CoreResult};
use crate::index::header::DAY_FIRST_UID_COUNT;
use crate::index::keywords::bitmap_set;
use crate::index::IndexMap;
use crate::log::records::{
    decode_ext_rec_updates, decode_ext_reset, decode_patches, decode_uid_ranges, AppendRecord,
    ExpungeGuid, ExtAtomicInc, ExtIntro, FlagUpdate, KeywordUpdate, ModseqUpdate, RecordContext,
    EXT_ID_BY_NAME,
};
use crate::log::{LogPosition, LogView, RecordKind};
use crate::types::{unix_now, MailFlags, ModifyType, Seq, Uid};
use std::ops::RangeInclusive;
use std::sync::Arc;

const SECS_PER_DAY: u32 = 24 * 60 * 60;

/// The extension chosen by the last EXT_INTRO.
#[derive(Debug, Clone, Copy)]
struct SelectedExt {
    idx: usize,
    /// Record size the writer used, which may be smaller than the map's.
    record_size: usize,
}

/// Applies log records to a private copy of a map.
#[derive(Debug)]
pub struct MapUpdater {
    map: IndexMap,
    ext: Option<SelectedExt>,
    now: u32,
}

impl MapUpdater {
    /// Starts updating `map`.
    #[must_use]
    pub fn new(map: IndexMap) -> Self {
        Self {
            map,
            ext: None,
            now: unix_now(),
        }
    }

    /// Returns the map as updated so far.
    #[must_use]
    pub fn map(&self) -> &IndexMap {
        &self.map
    }

    /// Applies one record.
    ///
    /// # Errors
    ///
    /// Returns `LogCorrupted` for a record that cannot apply to the map:
    /// an append below `next_uid`, extension records without an intro,
    /// counters that would overflow, or header changes out of range.
    pub fn apply(&mut self, ctx: &RecordContext<'_>, kind: RecordKind, data: &[u8]) -> CoreResult<()> {
        match kind {
            RecordKind::Append => {
                for rec in AppendRecord::decode_all(ctx, data)? {
                    self.append(ctx, rec)?;
                }
            }
            RecordKind::Expunge => {
                for (uid1, uid2) in decode_uid_ranges(ctx, data)? {
                    self.expunge(ctx, uid1, uid2)?;
                }
            }
            RecordKind::ExpungeGuid => {
                for expunge in ExpungeGuid::decode_all(ctx, data)? {
                    self.expunge(ctx, expunge.uid, expunge.uid)?;
                }
            }
            RecordKind::FlagUpdate => {
                for update in FlagUpdate::decode_all(ctx, data)? {
                    self.update_flags(ctx, &update)?;
                }
            }
            RecordKind::HeaderUpdate => {
                for (offset, bytes) in decode_patches(ctx, data)? {
                    self.map
                        .update_header_bytes(usize::from(offset), bytes)
                        .map_err(|err| ctx.corrupt(err.to_string()))?;
                }
            }
            RecordKind::ExtIntro => self.ext_intro(ctx, &ExtIntro::decode(ctx, data)?)?,
            RecordKind::ExtReset => {
                let ext = self.selected(ctx)?;
                if !decode_ext_reset(ctx, data)? {
                    self.map.clear_ext(ext.idx);
                }
            }
            RecordKind::ExtHdrUpdate => {
                let ext = self.selected(ctx)?;
                for (offset, bytes) in decode_patches(ctx, data)? {
                    let header = self.map.ext_header_mut(ext.idx);
                    let size = header.len();
                    let offset = usize::from(offset);
                    let Some(target) = header.get_mut(offset..offset + bytes.len()) else {
                        return Err(ctx.corrupt(format!(
                            "extension header update {offset}+{} outside {size} bytes",
                            bytes.len()
                        )));
                    };
                    target.copy_from_slice(bytes);
                }
            }
            RecordKind::ExtRecUpdate => {
                let ext = self.selected(ctx)?;
                for (uid, bytes) in decode_ext_rec_updates(ctx, data, ext.record_size)? {
                    let Some(seq) = self.map.lookup_seq(uid) else {
                        continue;
                    };
                    if let Some(rec) = self.map.ext_record_mut(seq, ext.idx) {
                        let len = rec.len().min(bytes.len());
                        rec[..len].copy_from_slice(&bytes[..len]);
                    }
                }
            }
            RecordKind::ExtAtomicInc => {
                let ext = self.selected(ctx)?;
                for inc in ExtAtomicInc::decode_all(ctx, data)? {
                    self.atomic_inc(ctx, ext, inc)?;
                }
            }
            RecordKind::KeywordUpdate => self.update_keyword(ctx, &KeywordUpdate::decode(ctx, data)?)?,
            RecordKind::KeywordReset => {
                for (uid1, uid2) in decode_uid_ranges(ctx, data)? {
                    for seq in self.seqs(uid1, uid2) {
                        if let Some(bitmap) = self.map.keyword_bitmap_mut(seq) {
                            bitmap.fill(0);
                        }
                    }
                }
            }
            RecordKind::ModseqUpdate => {
                for update in ModseqUpdate::decode_all(ctx, data)? {
                    self.map.set_highest_modseq(update.modseq);
                }
            }
            RecordKind::Boundary => {}
        }
        Ok(())
    }

    /// Finishes the update, recording that the map reflects the log up to
    /// `end`.
    #[must_use]
    pub fn finish(mut self, end: LogPosition) -> IndexMap {
        let hdr = self.map.hdr_mut();
        hdr.log_file_seq = end.file_seq;
        hdr.log_file_head_offset = end.offset as u32;
        hdr.log_file_tail_offset = end.offset as u32;
        self.map
    }

    /// Sequences of the messages with UIDs in `uid1..=uid2`.
    fn seqs(&self, uid1: Uid, uid2: Uid) -> RangeInclusive<Seq> {
        let (seq1, seq2) = self.map.lookup_seq_range(uid1, uid2).unwrap_or((1, 0));
        seq1..=seq2
    }

    fn selected(&self, ctx: &RecordContext<'_>) -> CoreResult<SelectedExt> {
        self.ext
            .ok_or_else(|| ctx.corrupt("extension record without a preceding intro"))
    }

    fn append(&mut self, ctx: &RecordContext<'_>, rec: AppendRecord) -> CoreResult<()> {
        let next_uid = self.map.header().next_uid;
        if rec.uid < next_uid {
            return Err(ctx.corrupt(format!(
                "append with uid {}, but next_uid is {next_uid}",
                rec.uid
            )));
        }
        self.map.push_record(rec.uid, rec.flags);
        self.map.hdr_mut().next_uid = rec.uid + 1;
        self.update_counts(ctx, rec.uid, MailFlags::empty(), rec.flags)?;
        self.update_day_first_uid(rec.uid);
        Ok(())
    }

    fn expunge(&mut self, ctx: &RecordContext<'_>, uid1: Uid, uid2: Uid) -> CoreResult<()> {
        let Some((seq1, seq2)) = self.map.lookup_seq_range(uid1, uid2) else {
            return Ok(());
        };
        for seq in seq1..=seq2 {
            if let Some(rec) = self.map.record(seq) {
                self.update_counts(ctx, rec.uid, rec.flags, MailFlags::empty())?;
            }
        }
        self.map.remove_records(seq1, seq2);
        Ok(())
    }

    fn update_flags(&mut self, ctx: &RecordContext<'_>, update: &FlagUpdate) -> CoreResult<()> {
        for seq in self.seqs(update.uid1, update.uid2) {
            let Some(old) = self.map.record(seq) else {
                continue;
            };
            let flags = (old.flags | update.add) - update.remove;
            if let Some(rec) = self.map.record_mut(seq) {
                rec[4] = flags.bits();
            }
            self.update_counts(ctx, old.uid, old.flags, flags)?;
        }
        Ok(())
    }

    /// Keeps the seen/deleted counters and low-water marks in step with a
    /// message going from `old` to `new` flags.
    fn update_counts(
        &mut self,
        ctx: &RecordContext<'_>,
        uid: Uid,
        old: MailFlags,
        new: MailFlags,
    ) -> CoreResult<()> {
        let hdr = self.map.hdr_mut();
        let underflow = |what: &str| ctx.corrupt(format!("{what} messages count dropped below zero"));

        match (old.contains(MailFlags::SEEN), new.contains(MailFlags::SEEN)) {
            (false, true) => hdr.seen_messages_count += 1,
            (true, false) => {
                hdr.seen_messages_count = hdr
                    .seen_messages_count
                    .checked_sub(1)
                    .ok_or_else(|| underflow("seen"))?;
            }
            _ => {}
        }
        if !new.contains(MailFlags::SEEN) && uid < hdr.first_unseen_uid_lowwater {
            hdr.first_unseen_uid_lowwater = uid;
        }

        match (old.contains(MailFlags::DELETED), new.contains(MailFlags::DELETED)) {
            (false, true) => {
                hdr.deleted_messages_count += 1;
                if uid < hdr.first_deleted_uid_lowwater {
                    hdr.first_deleted_uid_lowwater = uid;
                }
            }
            (true, false) => {
                hdr.deleted_messages_count = hdr
                    .deleted_messages_count
                    .checked_sub(1)
                    .ok_or_else(|| underflow("deleted"))?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Records `uid` as the first UID appended today, shifting older days
    /// along.
    ///
    /// A stamp that is not at the start of a day counts as the day it falls
    /// in. A stamp in a later day than today cannot be trusted, so the
    /// buckets are cleared.
    fn update_day_first_uid(&mut self, uid: Uid) {
        let today = self.now - self.now % SECS_PER_DAY;
        let hdr = self.map.hdr_mut();
        let stamp_day = hdr.day_stamp - hdr.day_stamp % SECS_PER_DAY;
        if stamp_day == today {
            hdr.day_stamp = today;
            return;
        }
        let days = if stamp_day > today {
            tracing::warn!(day_stamp = hdr.day_stamp, today, "index day stamp is in the future, resetting");
            hdr.day_first_uid = [0; DAY_FIRST_UID_COUNT];
            DAY_FIRST_UID_COUNT
        } else {
            (((today - stamp_day) / SECS_PER_DAY) as usize).min(DAY_FIRST_UID_COUNT)
        };
        if days < DAY_FIRST_UID_COUNT {
            hdr.day_first_uid.copy_within(..DAY_FIRST_UID_COUNT - days, days);
        }
        let carried = hdr.day_first_uid[0];
        for slot in &mut hdr.day_first_uid[1..days] {
            *slot = carried;
        }
        hdr.day_stamp = today;
        hdr.day_first_uid[0] = uid;
    }

    fn ext_intro(&mut self, ctx: &RecordContext<'_>, intro: &ExtIntro) -> CoreResult<()> {
        let name = if intro.ext_id == EXT_ID_BY_NAME {
            intro.name.clone()
        } else {
            match self.map.extensions().get(intro.ext_id as usize) {
                Some(ext) => ext.name.clone(),
                None => {
                    return Err(ctx.corrupt(format!(
                        "intro for unknown extension id {}",
                        intro.ext_id
                    )))
                }
            }
        };
        let idx = self.map.ensure_ext(
            &name,
            intro.hdr_size,
            intro.record_size,
            intro.record_align,
            intro.no_shrink(),
        );
        self.ext = Some(SelectedExt {
            idx,
            record_size: usize::from(intro.record_size),
        });
        Ok(())
    }

    fn atomic_inc(&mut self, ctx: &RecordContext<'_>, ext: SelectedExt, inc: ExtAtomicInc) -> CoreResult<()> {
        let Some(seq) = self.map.lookup_seq(inc.uid) else {
            return Ok(());
        };
        let Some(rec) = self.map.ext_record_mut(seq, ext.idx) else {
            return Err(ctx.corrupt("atomic increment of an extension without records"));
        };
        let width = rec.len();
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(ctx.corrupt(format!("atomic increment of a {width}-byte record")));
        }
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(rec);
        let value = i128::from(u64::from_le_bytes(bytes)) + i128::from(inc.diff);
        let max = if width == 8 {
            i128::from(u64::MAX)
        } else {
            (1i128 << (width * 8)) - 1
        };
        if value < 0 {
            return Err(ctx.corrupt(format!("atomic increment drops uid {} below zero", inc.uid)));
        }
        if value > max {
            return Err(ctx.corrupt(format!("atomic increment overflows uid {}", inc.uid)));
        }
        rec.copy_from_slice(&(value as u64).to_le_bytes()[..width]);
        Ok(())
    }

    fn update_keyword(&mut self, ctx: &RecordContext<'_>, update: &KeywordUpdate) -> CoreResult<()> {
        let registry = Arc::clone(self.map.registry());
        let id = registry
            .keyword_lookup_or_create(&update.name)
            .map_err(|err| ctx.corrupt(err.to_string()))?;
        let (idx, set) = match update.modify {
            ModifyType::Add => (self.map.add_keyword(id)?, true),
            ModifyType::Remove => match self.map.keyword_index(id) {
                Some(idx) => (idx, false),
                None => return Ok(()),
            },
            ModifyType::Replace => return Err(ctx.corrupt("keyword replace in log")),
        };
        for &(uid1, uid2) in &update.ranges {
            for seq in self.seqs(uid1, uid2) {
                if let Some(bitmap) = self.map.keyword_bitmap_mut(seq) {
                    bitmap_set(bitmap, idx, set);
                }
            }
        }
        Ok(())
    }
}

/// Applies every remaining record of `view` to a copy of `map`.
///
/// A view that crosses an index reset starts from an empty map with the
/// same index id.
///
/// # Errors
///
/// Returns `LogCorrupted` or `ViewBroken` from the view, or any error of
/// [`MapUpdater::apply`].
pub fn replay(map: &IndexMap, view: &mut LogView) -> CoreResult<IndexMap> {
    let base = if view.is_reset() {
        tracing::warn!(path = %map.path().display(), "log resets the index, starting from an empty map");
        IndexMap::new_empty(map.path(), map.header().indexid, Arc::clone(map.registry()))
    } else {
        map.clone()
    };
    let mut updater = MapUpdater::new(base);
    let mut records = 0u64;
    while let Some((ctx, header, data)) = view.next_record()? {
        let Some(kind) = header.kind() else {
            return Err(CoreError::log_corrupted(ctx.path, ctx.offset, ctx.raw_type, "unknown record type"));
        };
        updater.apply(&ctx, kind, data)?;
        records += 1;
    }
    updater.map.set_highest_modseq(view.prev_modseq());
    let end = view.position();
    tracing::debug!(
        path = %map.path().display(),
        records,
        file_seq = end.file_seq,
        offset = end.offset,
        "replayed log into map"
    );
    Ok(updater.finish(end))
}
