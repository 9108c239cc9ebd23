//! The transaction builder.

use crate::index::IndexMap;
use crate::log::records::AppendRecord;
use crate::registry::{ExtId, KeywordId, KeywordSet};
use crate::seq_range::SeqRangeSet;
use crate::transaction::flags::FlagRanges;
use crate::transaction::TransactionFlags;
use crate::types::{Guid, MailFlags, ModifyType, Modseq, Seq, Uid};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Staged raw bytes of a header, with a mask of which bytes were written.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeaderChange {
    data: Vec<u8>,
    mask: Vec<bool>,
}

impl HeaderChange {
    pub(crate) fn set(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
            self.mask.resize(end, false);
        }
        self.data[offset..end].copy_from_slice(bytes);
        self.mask[offset..end].fill(true);
    }

    pub(crate) fn is_set(&self, offset: usize, len: usize) -> bool {
        self.mask
            .get(offset..offset + len)
            .is_some_and(|bytes| bytes.iter().all(|&set| set))
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.mask.contains(&true)
    }

    fn clear(&mut self) {
        self.data.clear();
        self.mask.clear();
    }

    /// Returns the written bytes as `(offset, data)` runs.
    pub(crate) fn patches(&self) -> Vec<(u16, &[u8])> {
        let mut patches = Vec::new();
        let mut pos = 0;
        while pos < self.mask.len() {
            if !self.mask[pos] {
                pos += 1;
                continue;
            }
            let start = pos;
            while pos < self.mask.len() && self.mask[pos] {
                pos += 1;
            }
            patches.push((start as u16, &self.data[start..pos]));
        }
        patches
    }
}

/// Layout an extension is staged against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExtLayout {
    pub name: String,
    pub hdr_size: u32,
    pub record_size: u16,
    pub record_align: u16,
}

/// Staged changes to one extension.
#[derive(Debug, Clone)]
pub(crate) struct ExtChanges {
    pub layout: ExtLayout,
    /// `Some(preserve_data)` if the extension is reset.
    pub reset: Option<bool>,
    pub header: HeaderChange,
    pub records: BTreeMap<Seq, Vec<u8>>,
    pub atomic_incs: BTreeMap<Seq, i32>,
}

/// Staged keyword additions and removals for one keyword.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeywordChanges {
    pub add: SeqRangeSet,
    pub remove: SeqRangeSet,
}

/// A set of index changes staged against one map.
///
/// Nothing reaches the log until the transaction is passed to
/// [`MailIndex::commit`](crate::MailIndex::commit). Existing messages are
/// addressed by their sequence in the base map; appended messages get
/// sequences from [`Transaction::first_new_seq`] upwards.
///
/// Misuse (sequences out of range, expunging an append that is not the
/// last one, data of the wrong size) is a caller bug and panics.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) view: Arc<IndexMap>,
    pub(crate) flags: TransactionFlags,
    pub(crate) first_new_seq: Seq,
    pub(crate) appends: Vec<AppendRecord>,
    highest_explicit_uid: Uid,
    pub(crate) expunges: BTreeMap<Seq, Guid>,
    pub(crate) flag_updates: FlagRanges,
    pub(crate) keyword_resets: SeqRangeSet,
    pub(crate) keyword_updates: BTreeMap<KeywordId, KeywordChanges>,
    pub(crate) ext_changes: BTreeMap<ExtId, ExtChanges>,
    pub(crate) pre_hdr: HeaderChange,
    pub(crate) post_hdr: HeaderChange,
    pub(crate) modseq_updates: BTreeMap<Seq, Modseq>,
}

impl Transaction {
    pub(crate) fn new(view: Arc<IndexMap>, flags: TransactionFlags) -> Self {
        let first_new_seq = view.messages_count() + 1;
        Self {
            view,
            flags,
            first_new_seq,
            appends: Vec::new(),
            highest_explicit_uid: 0,
            expunges: BTreeMap::new(),
            flag_updates: FlagRanges::new(),
            keyword_resets: SeqRangeSet::new(),
            keyword_updates: BTreeMap::new(),
            ext_changes: BTreeMap::new(),
            pre_hdr: HeaderChange::default(),
            post_hdr: HeaderChange::default(),
            modseq_updates: BTreeMap::new(),
        }
    }

    /// Returns the map the transaction was started on.
    #[must_use]
    pub fn view(&self) -> &Arc<IndexMap> {
        &self.view
    }

    /// Returns the transaction flags.
    #[must_use]
    pub fn flags(&self) -> TransactionFlags {
        self.flags
    }

    /// Returns the sequence of the first appended message.
    #[must_use]
    pub fn first_new_seq(&self) -> Seq {
        self.first_new_seq
    }

    /// Returns the number of staged appends.
    #[must_use]
    pub fn append_count(&self) -> u32 {
        self.appends.len() as u32
    }

    /// Returns the number of messages the view would have after commit,
    /// before expunges.
    #[must_use]
    pub fn messages_count(&self) -> u32 {
        self.first_new_seq - 1 + self.append_count()
    }

    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.appends.is_empty()
            && self.expunges.is_empty()
            && self.flag_updates.is_empty()
            && self.keyword_resets.is_empty()
            && self.keyword_updates.is_empty()
            && self.ext_changes.is_empty()
            && self.pre_hdr.is_empty()
            && self.post_hdr.is_empty()
            && self.modseq_updates.is_empty()
    }

    fn last_append_seq(&self) -> Option<Seq> {
        (!self.appends.is_empty()).then(|| self.first_new_seq + self.append_count() - 1)
    }

    fn check_seq(&self, seq: Seq) {
        assert!(
            seq >= 1 && seq <= self.messages_count(),
            "sequence {seq} out of range 1..={}",
            self.messages_count()
        );
    }

    /// Stages a new message and returns its sequence.
    ///
    /// `uid` 0 assigns the next free UID at commit. An explicit UID is kept
    /// if it is still free at commit, and replaced by the next free one
    /// otherwise.
    ///
    /// # Panics
    ///
    /// Panics if an explicit `uid` is not above the view's `next_uid` and
    /// every explicit UID appended before it.
    pub fn append(&mut self, uid: Uid) -> Seq {
        if uid != 0 {
            assert!(
                uid >= self.view.header().next_uid && uid > self.highest_explicit_uid,
                "appended uid {uid} is not increasing"
            );
            self.highest_explicit_uid = uid;
        }
        self.appends.push(AppendRecord {
            uid,
            flags: MailFlags::empty(),
        });
        self.messages_count()
    }

    /// Stages an expunge. `guid` may be all zeroes when the message has no
    /// GUID.
    ///
    /// Expunging the most recent append drops that append and everything
    /// staged for it instead.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is an append other than the most recent one.
    pub fn expunge(&mut self, seq: Seq, guid: Guid) {
        self.check_seq(seq);
        if seq < self.first_new_seq {
            self.expunges.insert(seq, guid);
            return;
        }
        assert_eq!(
            Some(seq),
            self.last_append_seq(),
            "only the most recent append can be expunged"
        );
        self.appends.pop();
        self.forget_seq(seq);
    }

    /// Drops everything staged for one sequence.
    fn forget_seq(&mut self, seq: Seq) {
        self.keyword_resets.remove(seq);
        for changes in self.keyword_updates.values_mut() {
            changes.add.remove(seq);
            changes.remove.remove(seq);
        }
        self.keyword_updates
            .retain(|_, changes| !(changes.add.is_empty() && changes.remove.is_empty()));
        for changes in self.ext_changes.values_mut() {
            changes.records.remove(&seq);
            changes.atomic_incs.remove(&seq);
        }
        self.modseq_updates.remove(&seq);
    }

    /// Stages a flag change over `seq1..=seq2`.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty or out of bounds.
    pub fn update_flags(&mut self, seq1: Seq, seq2: Seq, mode: ModifyType, flags: MailFlags) {
        assert!(seq1 <= seq2, "invalid range {seq1}..={seq2}");
        self.check_seq(seq1);
        self.check_seq(seq2);
        let (add, remove) = match mode {
            ModifyType::Add => (flags, MailFlags::empty()),
            ModifyType::Remove => (MailFlags::empty(), flags),
            ModifyType::Replace => (flags, !flags),
        };

        if seq2 >= self.first_new_seq {
            let from = seq1.max(self.first_new_seq) - self.first_new_seq;
            let to = seq2 - self.first_new_seq;
            for rec in &mut self.appends[from as usize..=to as usize] {
                rec.flags = (rec.flags | add) - remove;
            }
        }
        if seq1 < self.first_new_seq {
            let last = seq2.min(self.first_new_seq - 1);
            self.flag_updates.insert(seq1, last, add, remove);
        }
    }

    /// Stages a keyword change for one message.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is out of bounds.
    pub fn update_keywords(&mut self, seq: Seq, mode: ModifyType, keywords: &KeywordSet) {
        self.check_seq(seq);
        let add = match mode {
            ModifyType::Add => true,
            ModifyType::Remove => false,
            ModifyType::Replace => {
                self.keyword_resets.add(seq);
                for changes in self.keyword_updates.values_mut() {
                    changes.add.remove(seq);
                    changes.remove.remove(seq);
                }
                true
            }
        };
        for id in keywords.iter() {
            let changes = self.keyword_updates.entry(id).or_default();
            if add {
                changes.remove.remove(seq);
                changes.add.add(seq);
            } else {
                changes.add.remove(seq);
                changes.remove.add(seq);
            }
        }
        self.keyword_updates
            .retain(|_, changes| !(changes.add.is_empty() && changes.remove.is_empty()));
    }

    /// Stages a raw base-header change. `prepend` changes are applied
    /// before the transaction's other records, the rest after them.
    ///
    /// # Panics
    ///
    /// Panics if the change reaches past the base header.
    pub fn update_header(&mut self, offset: usize, data: &[u8], prepend: bool) {
        let base = usize::from(self.view.header().base_header_size);
        assert!(
            offset + data.len() <= base,
            "header change {offset}+{} outside base header {base}",
            data.len()
        );
        if prepend {
            self.pre_hdr.set(offset, data);
        } else {
            self.post_hdr.set(offset, data);
        }
    }

    /// Returns the staged changes of an extension, creating them with the
    /// layout the view has for it (or its registered defaults).
    fn ext_changes(&mut self, ext: ExtId) -> &mut ExtChanges {
        let view = &self.view;
        self.ext_changes.entry(ext).or_insert_with(|| {
            let reg = view
                .registry()
                .ext(ext)
                .unwrap_or_else(|| panic!("{ext} is not registered"));
            let layout = match view.ext(&reg.name) {
                Some(existing) => ExtLayout {
                    name: reg.name.clone(),
                    hdr_size: existing.hdr_size,
                    record_size: existing.record_size,
                    record_align: existing.record_align,
                },
                None => ExtLayout {
                    name: reg.name.clone(),
                    hdr_size: reg.hdr_size,
                    record_size: reg.record_size,
                    record_align: reg.record_align,
                },
            };
            ExtChanges {
                layout,
                reset: None,
                header: HeaderChange::default(),
                records: BTreeMap::new(),
                atomic_incs: BTreeMap::new(),
            }
        })
    }

    /// Stages a change to an extension's header data.
    ///
    /// # Panics
    ///
    /// Panics if `ext` is not registered or the change does not fit the
    /// extension's header.
    pub fn update_ext_header(&mut self, ext: ExtId, offset: usize, data: &[u8]) {
        let changes = self.ext_changes(ext);
        let size = changes.layout.hdr_size as usize;
        assert!(
            offset + data.len() <= size,
            "{ext} header change {offset}+{} outside {size} bytes",
            data.len()
        );
        changes.header.set(offset, data);
    }

    /// Stages a message's extension record data, returning the data staged
    /// for it earlier in this transaction.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is out of bounds, `ext` is not registered or has no
    /// records, or `data` is not exactly one record.
    pub fn update_ext_record(&mut self, ext: ExtId, seq: Seq, data: &[u8]) -> Option<Vec<u8>> {
        self.check_seq(seq);
        let changes = self.ext_changes(ext);
        let size = usize::from(changes.layout.record_size);
        assert!(size > 0, "{ext} has no record data");
        assert_eq!(data.len(), size, "{ext} record data must be {size} bytes");
        changes.records.insert(seq, data.to_vec())
    }

    /// Stages an extension reset. Without `preserve_data` the extension's
    /// header and record data are zeroed, and changes staged for it so far
    /// are dropped.
    ///
    /// # Panics
    ///
    /// Panics if `ext` is not registered.
    pub fn reset_ext(&mut self, ext: ExtId, preserve_data: bool) {
        let changes = self.ext_changes(ext);
        changes.reset = Some(preserve_data);
        if !preserve_data {
            changes.header.clear();
            changes.records.clear();
            changes.atomic_incs.clear();
        }
    }

    /// Stages adding `diff` to the integer stored in a message's extension
    /// record.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is out of bounds, or the extension's record is not
    /// 1, 2, 4 or 8 bytes.
    pub fn atomic_inc_ext(&mut self, ext: ExtId, seq: Seq, diff: i32) {
        self.check_seq(seq);
        let changes = self.ext_changes(ext);
        assert!(
            matches!(changes.layout.record_size, 1 | 2 | 4 | 8),
            "{ext} record of {} bytes is not a counter",
            changes.layout.record_size
        );
        let total = changes.atomic_incs.entry(seq).or_insert(0);
        *total = total.wrapping_add(diff);
    }

    /// Stages raising a message's modseq to at least `modseq`.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is out of bounds.
    pub fn update_modseq(&mut self, seq: Seq, modseq: Modseq) {
        self.check_seq(seq);
        let staged = self.modseq_updates.entry(seq).or_insert(0);
        *staged = (*staged).max(modseq);
    }

    /// Drops every staged change.
    pub fn reset(&mut self) {
        self.appends.clear();
        self.highest_explicit_uid = 0;
        self.expunges.clear();
        self.flag_updates.clear();
        self.keyword_resets.clear();
        self.keyword_updates.clear();
        self.ext_changes.clear();
        self.pre_hdr.clear();
        self.post_hdr.clear();
        self.modseq_updates.clear();
    }
}
