//! Writing a transaction's changes as log records.
//!
//! Records go out in a fixed order: leading header changes, extension
//! intros with resets and header changes, appends, flag changes, extension
//! record changes and increments, keyword resets and changes, modseq
//! changes, expunges and trailing header changes. Replaying them in that
//! order gives the same result as applying the staged calls one by one.

use crate::index::header::offsets;
use crate::index::IndexMap;
use crate::log::records::{
    encode_ext_rec_update, encode_ext_reset, encode_patch, encode_uid_ranges, AppendRecord,
    ExpungeGuid, ExtAtomicInc, ExtIntro, FlagUpdate, KeywordUpdate, ModseqUpdate, UidRange,
    EXT_ID_BY_NAME, EXT_INTRO_NO_SHRINK,
};
use crate::log::{LogAppend, RecordKind};
use crate::seq_range::{SeqRange, SeqRangeSet};
use crate::transaction::builder::{ExtLayout, HeaderChange, Transaction};
use crate::types::{unix_now, ModifyType, Seq, Uid};

/// Converts the transaction's sequences to UIDs.
struct UidMapper<'a> {
    view: &'a IndexMap,
    first_new_seq: Seq,
    appends: &'a [AppendRecord],
}

impl UidMapper<'_> {
    fn uid(&self, seq: Seq) -> Option<Uid> {
        if seq < self.first_new_seq {
            self.view.uid(seq)
        } else {
            self.appends
                .get((seq - self.first_new_seq) as usize)
                .map(|rec| rec.uid)
        }
    }

    /// Maps sequence ranges to UID ranges, splitting them where existing
    /// messages end and appends begin.
    fn ranges<'r>(&self, seqs: impl IntoIterator<Item = &'r SeqRange>) -> Vec<UidRange> {
        let mut out = Vec::new();
        for &(seq1, seq2) in seqs {
            if seq1 < self.first_new_seq {
                let last = seq2.min(self.first_new_seq - 1);
                if let (Some(uid1), Some(uid2)) = (self.uid(seq1), self.uid(last)) {
                    out.push((uid1, uid2));
                }
            }
            if seq2 >= self.first_new_seq {
                let first = seq1.max(self.first_new_seq);
                if let (Some(uid1), Some(uid2)) = (self.uid(first), self.uid(seq2)) {
                    out.push((uid1, uid2));
                }
            }
        }
        out
    }
}

/// Gives every append a UID, starting at `next_uid`.
fn assign_uids(appends: &[AppendRecord], next_uid: Uid) -> Vec<AppendRecord> {
    let mut next = next_uid;
    appends
        .iter()
        .map(|rec| {
            let uid = if rec.uid >= next { rec.uid } else { next };
            next = uid + 1;
            AppendRecord { uid, ..*rec }
        })
        .collect()
}

fn add_patches(append: &mut LogAppend, kind: RecordKind, change: &HeaderChange) {
    let patches = change.patches();
    if patches.is_empty() {
        return;
    }
    let mut buf = Vec::new();
    for (offset, data) in patches {
        encode_patch(&mut buf, offset, data);
    }
    append.add(kind, &buf);
}

fn add_intro(append: &mut LogAppend, layout: &ExtLayout) {
    let mut buf = Vec::new();
    ExtIntro {
        ext_id: EXT_ID_BY_NAME,
        hdr_size: layout.hdr_size,
        record_size: layout.record_size,
        record_align: layout.record_align,
        flags: EXT_INTRO_NO_SHRINK,
        name: layout.name.clone(),
    }
    .encode(&mut buf);
    append.add(RecordKind::ExtIntro, &buf);
}

fn add_uid_ranges(append: &mut LogAppend, kind: RecordKind, ranges: &[UidRange]) {
    if ranges.is_empty() {
        return;
    }
    let mut buf = Vec::with_capacity(ranges.len() * 8);
    encode_uid_ranges(&mut buf, ranges);
    append.add(kind, &buf);
}

/// Adds `tx`'s records to `append`. `current` is the map synced up to the
/// log head; new UIDs are assigned from its `next_uid`.
///
/// Returns the UID range given to appended messages.
pub(crate) fn export(
    tx: &Transaction,
    current: &IndexMap,
    append: &mut LogAppend,
) -> Option<(Uid, Uid)> {
    let appends = assign_uids(&tx.appends, current.header().next_uid);
    let mapper = UidMapper {
        view: &tx.view,
        first_new_seq: tx.first_new_seq,
        appends: &appends,
    };

    let mut pre_hdr = tx.pre_hdr.clone();
    if !appends.is_empty()
        && current.header().uid_validity == 0
        && !pre_hdr.is_set(offsets::UID_VALIDITY, 4)
    {
        pre_hdr.set(offsets::UID_VALIDITY, &unix_now().max(1).to_le_bytes());
    }
    add_patches(append, RecordKind::HeaderUpdate, &pre_hdr);

    for changes in tx.ext_changes.values() {
        if changes.reset.is_none() && changes.header.is_empty() {
            continue;
        }
        add_intro(append, &changes.layout);
        if let Some(preserve_data) = changes.reset {
            let mut buf = Vec::with_capacity(4);
            encode_ext_reset(&mut buf, preserve_data);
            append.add(RecordKind::ExtReset, &buf);
        }
        add_patches(append, RecordKind::ExtHdrUpdate, &changes.header);
    }

    if !appends.is_empty() {
        let mut buf = Vec::with_capacity(appends.len() * AppendRecord::SIZE);
        for rec in &appends {
            rec.encode(&mut buf);
        }
        append.add(RecordKind::Append, &buf);
    }

    if !tx.flag_updates.is_empty() {
        let mut buf = Vec::with_capacity(tx.flag_updates.ranges().len() * FlagUpdate::SIZE);
        for range in tx.flag_updates.ranges() {
            let (Some(uid1), Some(uid2)) = (mapper.uid(range.seq1), mapper.uid(range.seq2)) else {
                continue;
            };
            FlagUpdate {
                uid1,
                uid2,
                add: range.add,
                remove: range.remove,
                modseq_inc: false,
            }
            .encode(&mut buf);
        }
        append.add(RecordKind::FlagUpdate, &buf);
    }

    for changes in tx.ext_changes.values() {
        if changes.records.is_empty() {
            continue;
        }
        add_intro(append, &changes.layout);
        let mut buf = Vec::new();
        for (&seq, data) in &changes.records {
            if let Some(uid) = mapper.uid(seq) {
                encode_ext_rec_update(&mut buf, uid, data);
            }
        }
        append.add(RecordKind::ExtRecUpdate, &buf);
    }

    for changes in tx.ext_changes.values() {
        let incs: Vec<ExtAtomicInc> = changes
            .atomic_incs
            .iter()
            .filter(|&(_, &diff)| diff != 0)
            .filter_map(|(&seq, &diff)| mapper.uid(seq).map(|uid| ExtAtomicInc { uid, diff }))
            .collect();
        if incs.is_empty() {
            continue;
        }
        add_intro(append, &changes.layout);
        let mut buf = Vec::with_capacity(incs.len() * ExtAtomicInc::SIZE);
        for inc in &incs {
            inc.encode(&mut buf);
        }
        append.add(RecordKind::ExtAtomicInc, &buf);
    }

    add_uid_ranges(
        append,
        RecordKind::KeywordReset,
        &mapper.ranges(tx.keyword_resets.ranges()),
    );

    let registry = tx.view.registry();
    for (&id, changes) in &tx.keyword_updates {
        let Some(name) = registry.keyword_name(id) else {
            continue;
        };
        for (modify, seqs) in [(ModifyType::Add, &changes.add), (ModifyType::Remove, &changes.remove)] {
            let ranges = mapper.ranges(seqs.ranges());
            if ranges.is_empty() {
                continue;
            }
            let mut buf = Vec::new();
            KeywordUpdate {
                modify,
                name: name.clone(),
                ranges,
            }
            .encode(&mut buf);
            append.add(RecordKind::KeywordUpdate, &buf);
        }
    }

    if !tx.modseq_updates.is_empty() {
        let mut buf = Vec::with_capacity(tx.modseq_updates.len() * ModseqUpdate::SIZE);
        for (&seq, &modseq) in &tx.modseq_updates {
            if let Some(uid) = mapper.uid(seq) {
                ModseqUpdate { uid, modseq }.encode(&mut buf);
            }
        }
        append.add(RecordKind::ModseqUpdate, &buf);
    }

    let plain: SeqRangeSet = tx
        .expunges
        .iter()
        .filter(|(_, guid)| **guid == [0; 16])
        .map(|(&seq, _)| seq)
        .collect();
    add_uid_ranges(append, RecordKind::Expunge, &mapper.ranges(plain.ranges()));
    let mut buf = Vec::new();
    for (&seq, &guid) in tx.expunges.iter().filter(|(_, guid)| **guid != [0; 16]) {
        if let Some(uid) = mapper.uid(seq) {
            ExpungeGuid { uid, guid }.encode(&mut buf);
        }
    }
    if !buf.is_empty() {
        append.add(RecordKind::ExpungeGuid, &buf);
    }

    add_patches(append, RecordKind::HeaderUpdate, &tx.post_hdr);

    Some((appends.first()?.uid, appends.last()?.uid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log::format::LogFileHeader;
    use crate::log::records::{decode_patches, decode_uid_ranges, RecordContext};
    use crate::log::{LogPosition, LogView, RecordType, TransactionLog};
    use crate::registry::Registry;
    use crate::transaction::TransactionFlags;
    use crate::registry::{ExtId, KeywordSet};
    use crate::types::MailFlags;
    use proptest::prelude::*;
    use std::path::Path;
    use std::sync::Arc;

    fn base(uids: &[Uid], registry: Arc<Registry>) -> IndexMap {
        let mut map = IndexMap::new_empty("test.index", 1, registry);
        map.hdr_mut().uid_validity = 77;
        for &uid in uids {
            map.push_record(uid, MailFlags::empty());
        }
        map.hdr_mut().next_uid = uids.last().map_or(1, |uid| uid + 1);
        map
    }

    /// Exports `tx` into a fresh log and returns its records.
    fn records(tx: &Transaction, current: &IndexMap) -> (Vec<(RecordKind, Vec<u8>)>, Option<(Uid, Uid)>) {
        let log = TransactionLog::in_memory(
            Path::new("mem.log"),
            &Config::default(),
            LogFileHeader::new(1, 1, 0, 0),
        );
        let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
        let uids = export(tx, current, &mut append);
        append.commit().unwrap();

        let mut view = LogView::open(&log);
        view.set_bounds(LogPosition::new(1, 0), LogPosition::new(1, u64::MAX))
            .unwrap();
        let mut out = Vec::new();
        while let Some((hdr, data)) = view.next().unwrap() {
            out.push((hdr.kind().unwrap(), data.to_vec()));
        }
        (out, uids)
    }

    /// Exports `tx` into a fresh log and returns the bytes after the file
    /// header.
    fn log_bytes(tx: &Transaction, current: &IndexMap) -> Vec<u8> {
        let log = TransactionLog::in_memory(
            Path::new("mem.log"),
            &Config::default(),
            LogFileHeader::new(1, 1, 0, 0),
        );
        let mut append = LogAppend::begin(&log, RecordType::empty()).unwrap();
        export(tx, current, &mut append);
        append.commit().unwrap();

        let inner = log.lock_inner();
        let head = inner.head();
        head.snapshot()[head.hdr.hdr_size as usize..].to_vec()
    }

    /// Stages changes to the two existing messages plus `count` appends,
    /// each with flags, a keyword and extension data.
    fn stage(map: &Arc<IndexMap>, ext: ExtId, keywords: &KeywordSet, count: u32) -> Transaction {
        let mut tx = Transaction::new(Arc::clone(map), TransactionFlags::empty());
        tx.update_flags(1, 1, ModifyType::Add, MailFlags::FLAGGED);
        tx.expunge(2, [5; 16]);
        for i in 0..count {
            let seq = tx.append(0);
            tx.update_flags(seq, seq, ModifyType::Add, MailFlags::SEEN);
            tx.update_keywords(seq, ModifyType::Add, keywords);
            tx.update_ext_record(ext, seq, &i.to_le_bytes());
            tx.atomic_inc_ext(ext, seq, 1);
        }
        tx
    }

    fn ctx() -> RecordContext<'static> {
        RecordContext {
            path: Path::new("mem.log"),
            offset: 0,
            raw_type: 0,
        }
    }

    #[test]
    fn records_follow_the_fixed_order() {
        let registry = Registry::new();
        let ext = registry.register_ext("cache", 4, 4, 4);
        let keywords = registry.keywords_create(&["$Label1"]).unwrap();
        let map = Arc::new(base(&[1, 2, 3], Arc::clone(&registry)));
        let mut tx = Transaction::new(Arc::clone(&map), TransactionFlags::empty());

        tx.update_header(offsets::FIRST_RECENT_UID, &2u32.to_le_bytes(), false);
        tx.expunge(1, [0; 16]);
        tx.update_modseq(2, 9);
        tx.update_keywords(2, ModifyType::Add, &keywords);
        tx.update_ext_record(ext, 3, &[1, 2, 3, 4]);
        tx.update_flags(2, 3, ModifyType::Add, MailFlags::SEEN);
        tx.append(0);
        tx.update_ext_header(ext, 0, &[7]);

        let (records, uids) = records(&tx, &map);
        let kinds: Vec<RecordKind> = records.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecordKind::Boundary,
                RecordKind::ExtIntro,
                RecordKind::ExtHdrUpdate,
                RecordKind::Append,
                RecordKind::FlagUpdate,
                RecordKind::ExtIntro,
                RecordKind::ExtRecUpdate,
                RecordKind::KeywordUpdate,
                RecordKind::ModseqUpdate,
                RecordKind::Expunge,
                RecordKind::HeaderUpdate,
            ]
        );
        assert_eq!(uids, Some((4, 4)));
    }

    #[test]
    fn appends_get_uids_from_the_current_map() {
        let registry = Registry::new();
        let view = Arc::new(base(&[1], Arc::clone(&registry)));
        let current = base(&[1, 2, 3], registry);
        let mut tx = Transaction::new(view, TransactionFlags::empty());
        tx.append(0);
        tx.append(2);
        tx.append(10);
        tx.append(0);

        let (records, uids) = records(&tx, &current);
        assert_eq!(uids, Some((4, 11)));
        let appended = AppendRecord::decode_all(&ctx(), &records[1].1).unwrap();
        let assigned: Vec<Uid> = appended.iter().map(|rec| rec.uid).collect();
        assert_eq!(assigned, vec![4, 5, 10, 11]);
    }

    #[test]
    fn first_append_sets_uid_validity() {
        let registry = Registry::new();
        let mut map = IndexMap::new_empty("test.index", 1, registry);
        map.hdr_mut().uid_validity = 0;
        let map = Arc::new(map);
        let mut tx = Transaction::new(Arc::clone(&map), TransactionFlags::empty());
        tx.append(0);

        let (records, _) = records(&tx, &map);
        assert_eq!(records[1].0, RecordKind::HeaderUpdate);
        let patches = decode_patches(&ctx(), &records[1].1).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(usize::from(patches[0].0), offsets::UID_VALIDITY);
        assert_ne!(patches[0].1, &[0, 0, 0, 0]);
    }

    #[test]
    fn expunges_split_by_guid() {
        let registry = Registry::new();
        let map = Arc::new(base(&[5, 6, 7, 8], registry));
        let mut tx = Transaction::new(Arc::clone(&map), TransactionFlags::empty());
        tx.expunge(1, [0; 16]);
        tx.expunge(2, [0; 16]);
        tx.expunge(3, [3; 16]);
        tx.expunge(4, [0; 16]);

        let (records, _) = records(&tx, &map);
        assert_eq!(records[1].0, RecordKind::Expunge);
        assert_eq!(decode_uid_ranges(&ctx(), &records[1].1).unwrap(), vec![(5, 6), (8, 8)]);
        assert_eq!(records[2].0, RecordKind::ExpungeGuid);
        let guids = ExpungeGuid::decode_all(&ctx(), &records[2].1).unwrap();
        assert_eq!(guids, vec![ExpungeGuid { uid: 7, guid: [3; 16] }]);
    }

    #[test]
    fn keyword_ranges_split_between_existing_and_new_messages() {
        let registry = Registry::new();
        let keywords = registry.keywords_create(&["work"]).unwrap();
        let map = Arc::new(base(&[10, 20], Arc::clone(&registry)));
        let mut tx = Transaction::new(Arc::clone(&map), TransactionFlags::empty());
        tx.append(0);
        for seq in 1..=3 {
            tx.update_keywords(seq, ModifyType::Add, &keywords);
        }

        let (records, _) = records(&tx, &map);
        let (kind, data) = &records[2];
        assert_eq!(*kind, RecordKind::KeywordUpdate);
        let update = KeywordUpdate::decode(&ctx(), data).unwrap();
        assert_eq!(update.name, "work");
        assert_eq!(update.ranges, vec![(10, 20), (21, 21)]);
    }

    #[test]
    fn empty_transaction_writes_nothing() {
        let map = Arc::new(base(&[1], Registry::new()));
        let tx = Transaction::new(Arc::clone(&map), TransactionFlags::empty());
        let (records, uids) = records(&tx, &map);
        assert!(records.is_empty());
        assert_eq!(uids, None);
    }

    proptest! {
        #[test]
        fn expunged_trailing_appends_leave_no_trace(total in 1u32..8, dropped in 0u32..8) {
            let dropped = dropped % total;
            let registry = Registry::new();
            let ext = registry.register_ext("counter", 0, 4, 4);
            let keywords = registry.keywords_create(&["$Junk"]).unwrap();
            let map = Arc::new(base(&[1, 2], Arc::clone(&registry)));

            let mut tx = stage(&map, ext, &keywords, total);
            for seq in (tx.messages_count() - dropped + 1..=tx.messages_count()).rev() {
                tx.expunge(seq, [0; 16]);
            }
            let kept = stage(&map, ext, &keywords, total - dropped);

            prop_assert_eq!(tx.append_count(), total - dropped);
            prop_assert_eq!(log_bytes(&tx, &map), log_bytes(&kept, &map));
        }
    }
}
