//! The in-memory index snapshot.

use crate::error::{CoreError, CoreResult};
use crate::index::ext::{encode_ext_entry, parse_extensions, MapExt};
use crate::index::header::{check_header_compat, IndexHeader, BASE_RECORD_SIZE, INDEX_MINOR_VERSION};
use crate::index::keywords::{
    bitmap_get, encode_keywords_header, keyword_bitmap_size, parse_keywords, KEYWORDS_EXT_NAME,
};
use crate::registry::{KeywordId, KeywordSet, Registry};
use crate::types::{align_up, MailFlags, Modseq, Seq, Uid};
use mailindex_storage::IndexBytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The base part of one message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRecord {
    /// Message UID.
    pub uid: Uid,
    /// System flags.
    pub flags: MailFlags,
}

/// Result of the deep header check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyLevel {
    /// The header is consistent with the records.
    Consistent,
    /// A counter or UID invariant is broken; rebuild the index.
    NeedsRebuild(String),
    /// The header is from an older minor version; apply
    /// [`IndexMap::apply_upgrade_fixups`] once.
    NeedsUpgradeFixups,
}

/// Message record bytes, shared with the file they were read from until
/// the first modification.
#[derive(Debug, Clone)]
enum RecordBuf {
    Shared {
        bytes: Arc<dyn IndexBytes>,
        start: usize,
        len: usize,
    },
    Owned(Vec<u8>),
}

impl RecordBuf {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Shared { bytes, start, len } => &bytes.bytes()[*start..*start + *len],
            Self::Owned(data) => data,
        }
    }

    /// Moves shared records into private memory.
    fn make_mut(&mut self) -> &mut Vec<u8> {
        if let Self::Shared { .. } = self {
            *self = Self::Owned(self.as_slice().to_vec());
        }
        match self {
            Self::Owned(data) => data,
            Self::Shared { .. } => unreachable!("records were just copied"),
        }
    }
}

/// An immutable snapshot of one index: header, extension tables and
/// fixed-stride message records.
///
/// Maps are shared by `Arc`. Replaying the log clones the map (records
/// stay shared until the first write) and the new map replaces the old one
/// wholesale, so readers holding the old map are never disturbed.
#[derive(Debug, Clone)]
pub struct IndexMap {
    path: PathBuf,
    registry: Arc<Registry>,
    hdr: IndexHeader,
    /// The whole header area (`header_size` bytes). The base part is
    /// refreshed from `hdr` before it is read or written raw.
    header: Vec<u8>,
    records: RecordBuf,
    extensions: Vec<MapExt>,
    keyword_idx_map: Vec<KeywordId>,
    highest_modseq: Modseq,
}

impl IndexMap {
    /// Creates the map of an empty index.
    #[must_use]
    pub fn new_empty(path: impl Into<PathBuf>, indexid: u32, registry: Arc<Registry>) -> Self {
        let hdr = IndexHeader::new(indexid);
        Self {
            path: path.into(),
            registry,
            header: hdr.encode(),
            hdr,
            records: RecordBuf::Owned(Vec::new()),
            extensions: Vec::new(),
            keyword_idx_map: Vec::new(),
            highest_modseq: 0,
        }
    }

    /// Parses an index file image.
    ///
    /// `known_keywords` is the keyword table of an earlier map of the same
    /// index, or empty.
    ///
    /// # Errors
    ///
    /// Returns `IndexCorrupted` if the header is unusable or the extension
    /// or keyword tables fail validation.
    pub fn from_bytes(
        path: impl Into<PathBuf>,
        bytes: Arc<dyn IndexBytes>,
        registry: Arc<Registry>,
        known_keywords: &[KeywordId],
    ) -> CoreResult<Self> {
        let path = path.into();
        let data = bytes.bytes();
        let hdr = IndexHeader::decode(&path, data)?;
        if !check_header_compat(&path, &hdr, data.len() as u64) {
            return Err(CoreError::index_corrupted(&path, "incompatible index header"));
        }

        let header_size = hdr.header_size as usize;
        let record_size = hdr.record_size as usize;
        let present = (data.len() - header_size) / record_size;
        let count = present.min(hdr.messages_count as usize);
        let header = data[..header_size].to_vec();

        let extensions = parse_extensions(&path, &header, &hdr)?;
        let mut map = Self {
            path,
            registry,
            hdr,
            header,
            records: RecordBuf::Shared {
                bytes,
                start: header_size,
                len: count * record_size,
            },
            extensions,
            keyword_idx_map: Vec::new(),
            highest_modseq: 0,
        };
        map.keyword_idx_map = map.parse_keywords(known_keywords)?;
        Ok(map)
    }

    fn parse_keywords(&self, known: &[KeywordId]) -> CoreResult<Vec<KeywordId>> {
        let ext = self
            .ext(KEYWORDS_EXT_NAME)
            .map(|ext| (ext, self.ext_data(ext)));
        parse_keywords(&self.path, ext, &self.registry, known)
    }

    /// Returns the path of the index file this map belongs to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the registry keywords are resolved against.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the decoded base header.
    #[must_use]
    pub fn header(&self) -> &IndexHeader {
        &self.hdr
    }

    /// Returns the number of messages.
    #[must_use]
    pub fn messages_count(&self) -> u32 {
        self.hdr.messages_count
    }

    /// Returns the record stride.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.hdr.record_size as usize
    }

    /// Returns the highest modseq applied to this map.
    #[must_use]
    pub fn highest_modseq(&self) -> Modseq {
        self.highest_modseq
    }

    fn records_present(&self) -> usize {
        self.records.as_slice().len() / self.record_size()
    }

    /// Returns the raw bytes of a message record.
    #[must_use]
    pub fn record_bytes(&self, seq: Seq) -> Option<&[u8]> {
        if seq == 0 || seq > self.hdr.messages_count {
            return None;
        }
        let size = self.record_size();
        let start = (seq as usize - 1) * size;
        self.records.as_slice().get(start..start + size)
    }

    /// Returns the base part of a message record.
    #[must_use]
    pub fn record(&self, seq: Seq) -> Option<MessageRecord> {
        self.record_bytes(seq).map(|rec| MessageRecord {
            uid: u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]),
            flags: MailFlags::from_bits_retain(rec[4]),
        })
    }

    /// Returns the UID of a message.
    #[must_use]
    pub fn uid(&self, seq: Seq) -> Option<Uid> {
        self.record(seq).map(|rec| rec.uid)
    }

    /// Finds the sequence of the first message with UID `>= uid`.
    fn seq_at_or_after(&self, uid: Uid) -> Seq {
        let (mut lo, mut hi) = (1u32, self.hdr.messages_count + 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.uid(mid) {
                Some(found) if found < uid => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    /// Returns the sequence of the message with exactly this UID.
    #[must_use]
    pub fn lookup_seq(&self, uid: Uid) -> Option<Seq> {
        let seq = self.seq_at_or_after(uid);
        (self.uid(seq) == Some(uid)).then_some(seq)
    }

    /// Returns the sequence range of messages with UIDs in `uid1..=uid2`.
    #[must_use]
    pub fn lookup_seq_range(&self, uid1: Uid, uid2: Uid) -> Option<(Seq, Seq)> {
        let first = self.seq_at_or_after(uid1);
        let last = self.seq_at_or_after(uid2.saturating_add(1)).checked_sub(1)?;
        (first <= last && first <= self.hdr.messages_count).then_some((first, last))
    }

    /// Returns the map's extensions in header order.
    #[must_use]
    pub fn extensions(&self) -> &[MapExt] {
        &self.extensions
    }

    /// Returns the position of an extension in [`Self::extensions`].
    #[must_use]
    pub fn ext_index(&self, name: &str) -> Option<usize> {
        self.extensions.iter().position(|ext| ext.name == name)
    }

    /// Looks up an extension by name.
    #[must_use]
    pub fn ext(&self, name: &str) -> Option<&MapExt> {
        self.extensions.iter().find(|ext| ext.name == name)
    }

    fn ext_data(&self, ext: &MapExt) -> &[u8] {
        &self.header[ext.hdr_offset..ext.hdr_offset + ext.hdr_size as usize]
    }

    /// Returns an extension's header data.
    #[must_use]
    pub fn ext_header(&self, name: &str) -> Option<&[u8]> {
        self.ext(name).map(|ext| self.ext_data(ext))
    }

    /// Returns an extension's area of a message record.
    #[must_use]
    pub fn ext_record(&self, seq: Seq, name: &str) -> Option<&[u8]> {
        let ext = self.ext(name).filter(|ext| ext.record_size > 0)?;
        let start = usize::from(ext.record_offset);
        self.record_bytes(seq)?
            .get(start..start + usize::from(ext.record_size))
    }

    /// Returns the index's keywords in bitmap order.
    #[must_use]
    pub fn keywords(&self) -> &[KeywordId] {
        &self.keyword_idx_map
    }

    /// Returns the bitmap position of a keyword.
    #[must_use]
    pub fn keyword_index(&self, id: KeywordId) -> Option<usize> {
        self.keyword_idx_map.iter().position(|&known| known == id)
    }

    /// Returns the keywords set on a message.
    #[must_use]
    pub fn message_keywords(&self, seq: Seq) -> KeywordSet {
        let Some(bitmap) = self.ext_record(seq, KEYWORDS_EXT_NAME) else {
            return KeywordSet::new();
        };
        let ids = self
            .keyword_idx_map
            .iter()
            .enumerate()
            .filter(|&(idx, _)| bitmap_get(bitmap, idx))
            .map(|(_, &id)| id)
            .collect();
        KeywordSet::from_ids(ids)
    }

    /// Validates header counters and UIDs against the records.
    #[must_use]
    pub fn check_header(&self) -> ConsistencyLevel {
        let hdr = &self.hdr;
        let rebuild = |reason: String| ConsistencyLevel::NeedsRebuild(reason);

        if hdr.uid_validity == 0 && hdr.next_uid != 1 {
            return rebuild(format!("uid_validity is 0 but next_uid is {}", hdr.next_uid));
        }
        if hdr.next_uid == 0 {
            return rebuild("next_uid is 0".to_string());
        }
        if hdr.messages_count as usize > self.records_present() {
            return rebuild(format!(
                "messages_count {} exceeds the {} records present",
                hdr.messages_count,
                self.records_present()
            ));
        }
        if hdr.seen_messages_count > hdr.messages_count
            || hdr.deleted_messages_count > hdr.messages_count
        {
            return rebuild(format!(
                "seen {} / deleted {} counts exceed messages_count {}",
                hdr.seen_messages_count, hdr.deleted_messages_count, hdr.messages_count
            ));
        }
        if hdr.minor_version >= INDEX_MINOR_VERSION && hdr.first_recent_uid == 0 {
            return rebuild("first_recent_uid is 0".to_string());
        }
        if hdr.first_recent_uid > hdr.next_uid {
            return rebuild(format!(
                "first_recent_uid {} > next_uid {}",
                hdr.first_recent_uid, hdr.next_uid
            ));
        }
        if hdr.first_unseen_uid_lowwater > hdr.next_uid
            || hdr.first_deleted_uid_lowwater > hdr.next_uid
        {
            return rebuild("low-water mark beyond next_uid".to_string());
        }
        if let Some(last) = self.uid(hdr.messages_count) {
            if last == 0 || last >= hdr.next_uid {
                return rebuild(format!("last uid {last} not below next_uid {}", hdr.next_uid));
            }
        }
        if hdr.minor_version < INDEX_MINOR_VERSION {
            return ConsistencyLevel::NeedsUpgradeFixups;
        }
        ConsistencyLevel::Consistent
    }

    /// Brings a header from an older minor version up to date: historical
    /// `\Recent` flags are cleared and a zero `first_recent_uid` repaired.
    pub fn apply_upgrade_fixups(&mut self) {
        let size = self.record_size();
        let count = self.hdr.messages_count as usize;
        let records = self.records.make_mut();
        for rec in records.chunks_exact_mut(size).take(count) {
            rec[4] &= !MailFlags::RECENT.bits();
        }
        if self.hdr.first_recent_uid == 0 {
            self.hdr.first_recent_uid = 1;
        }
        self.hdr.minor_version = INDEX_MINOR_VERSION;
        tracing::info!(path = %self.path.display(), "applied index upgrade fixups");
    }

    /// Serializes the map as a complete index file.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let used = self.hdr.messages_count as usize * self.record_size();
        let mut out = Vec::with_capacity(self.header.len() + used);
        out.extend_from_slice(&self.header);
        self.hdr.encode_into(&mut out);
        out.extend_from_slice(&self.records.as_slice()[..used]);
        out
    }

    // Mutation, used while replaying the log into a private copy.

    pub(crate) fn hdr_mut(&mut self) -> &mut IndexHeader {
        &mut self.hdr
    }

    pub(crate) fn set_highest_modseq(&mut self, modseq: Modseq) {
        self.highest_modseq = self.highest_modseq.max(modseq);
    }

    /// Patches raw base-header bytes and re-decodes the header.
    pub(crate) fn update_header_bytes(&mut self, offset: usize, data: &[u8]) -> CoreResult<()> {
        let base = usize::from(self.hdr.base_header_size);
        if offset + data.len() > base {
            return Err(CoreError::index_corrupted(
                &self.path,
                format!(
                    "header update {offset}+{} outside base header {base}",
                    data.len()
                ),
            ));
        }
        self.hdr.encode_into(&mut self.header);
        self.header[offset..offset + data.len()].copy_from_slice(data);
        let hdr = IndexHeader::decode(&self.path, &self.header)?;
        if hdr.base_header_size != self.hdr.base_header_size
            || hdr.header_size != self.hdr.header_size
            || hdr.record_size != self.hdr.record_size
        {
            return Err(CoreError::index_corrupted(
                &self.path,
                "header update tried to change header layout",
            ));
        }
        self.hdr = hdr;
        Ok(())
    }

    pub(crate) fn record_mut(&mut self, seq: Seq) -> Option<&mut [u8]> {
        if seq == 0 || seq > self.hdr.messages_count {
            return None;
        }
        let size = self.record_size();
        let start = (seq as usize - 1) * size;
        self.records.make_mut().get_mut(start..start + size)
    }

    /// Appends a zeroed record with the given base fields.
    pub(crate) fn push_record(&mut self, uid: Uid, flags: MailFlags) {
        let size = self.record_size();
        let used = self.hdr.messages_count as usize * size;
        let records = self.records.make_mut();
        records.truncate(used);
        records.resize(used + size, 0);
        records[used..used + 4].copy_from_slice(&uid.to_le_bytes());
        records[used + 4] = flags.bits();
        self.hdr.messages_count += 1;
    }

    /// Removes the records `seq1..=seq2`.
    pub(crate) fn remove_records(&mut self, seq1: Seq, seq2: Seq) {
        debug_assert!(seq1 >= 1 && seq1 <= seq2 && seq2 <= self.hdr.messages_count);
        let size = self.record_size();
        let start = (seq1 as usize - 1) * size;
        let end = seq2 as usize * size;
        self.records.make_mut().drain(start..end);
        self.hdr.messages_count -= seq2 - seq1 + 1;
    }

    pub(crate) fn ext_header_mut(&mut self, idx: usize) -> &mut [u8] {
        let ext = &self.extensions[idx];
        let (start, len) = (ext.hdr_offset, ext.hdr_size as usize);
        &mut self.header[start..start + len]
    }

    pub(crate) fn ext_record_mut(&mut self, seq: Seq, idx: usize) -> Option<&mut [u8]> {
        let ext = &self.extensions[idx];
        let (start, len) = (usize::from(ext.record_offset), usize::from(ext.record_size));
        if len == 0 {
            return None;
        }
        self.record_mut(seq).map(|rec| &mut rec[start..start + len])
    }

    /// Zeroes an extension's header data and record areas.
    pub(crate) fn clear_ext(&mut self, idx: usize) {
        self.ext_header_mut(idx).fill(0);
        let ext = &self.extensions[idx];
        let (start, len) = (usize::from(ext.record_offset), usize::from(ext.record_size));
        if len == 0 {
            return;
        }
        let size = self.record_size();
        let count = self.hdr.messages_count as usize;
        for rec in self.records.make_mut().chunks_exact_mut(size).take(count) {
            rec[start..start + len].fill(0);
        }
    }

    /// Introduces an extension or changes its layout, returning its
    /// position.
    ///
    /// With `no_shrink` an existing extension only ever grows.
    pub(crate) fn ensure_ext(
        &mut self,
        name: &str,
        hdr_size: u32,
        record_size: u16,
        record_align: u16,
        no_shrink: bool,
    ) -> usize {
        let mut exts = self.extensions.clone();
        let idx = match self.ext_index(name) {
            Some(idx) => {
                let ext = &mut exts[idx];
                let (hdr_size, record_size) = if no_shrink {
                    (hdr_size.max(ext.hdr_size), record_size.max(ext.record_size))
                } else {
                    (hdr_size, record_size)
                };
                let record_align = record_align.max(1);
                if ext.hdr_size == hdr_size
                    && ext.record_size == record_size
                    && ext.record_align == record_align
                {
                    return idx;
                }
                ext.hdr_size = hdr_size;
                ext.record_size = record_size;
                ext.record_align = record_align;
                idx
            }
            None => {
                exts.push(MapExt {
                    name: name.to_string(),
                    hdr_offset: 0,
                    hdr_size,
                    record_offset: 0,
                    record_size,
                    record_align: record_align.max(1),
                });
                exts.len() - 1
            }
        };
        tracing::debug!(path = %self.path.display(), name, hdr_size, record_size, "extension layout changed");
        self.relayout(exts);
        idx
    }

    /// Rebuilds the header's extension area and the record layout for a
    /// new extension list. `exts` extends `self.extensions` position by
    /// position; offsets are recomputed here and data is carried over.
    fn relayout(&mut self, mut exts: Vec<MapExt>) {
        let mut offset = BASE_RECORD_SIZE;
        let mut max_align = 4;
        for ext in &mut exts {
            if ext.record_size == 0 {
                ext.record_offset = 0;
                continue;
            }
            let align = usize::from(ext.record_align);
            offset = align_up(offset, align);
            ext.record_offset = offset as u16;
            offset += usize::from(ext.record_size);
            max_align = max_align.max(align);
        }
        let new_record_size = align_up(offset, max_align);

        let old_size = self.record_size();
        let count = self.hdr.messages_count as usize;
        let old_records = self.records.as_slice();
        let mut records = vec![0u8; count * new_record_size];
        for (old, new) in old_records
            .chunks_exact(old_size)
            .take(count)
            .zip(records.chunks_exact_mut(new_record_size))
        {
            new[..BASE_RECORD_SIZE].copy_from_slice(&old[..BASE_RECORD_SIZE]);
            for (old_ext, new_ext) in self.extensions.iter().zip(&exts) {
                let len = usize::from(old_ext.record_size.min(new_ext.record_size));
                let from = usize::from(old_ext.record_offset);
                let to = usize::from(new_ext.record_offset);
                new[to..to + len].copy_from_slice(&old[from..from + len]);
            }
        }

        let base = usize::from(self.hdr.base_header_size);
        let area_start = align_up(base, 8);
        let mut area = Vec::new();
        for (i, ext) in exts.iter_mut().enumerate() {
            let mut data = self
                .extensions
                .get(i)
                .map(|old| self.ext_data(old).to_vec())
                .unwrap_or_default();
            data.resize(ext.hdr_size as usize, 0);
            ext.hdr_offset = encode_ext_entry(&mut area, area_start, ext, &data);
        }
        let mut header = self.header[..base].to_vec();
        header.resize(area_start, 0);
        header.extend_from_slice(&area);

        self.hdr.header_size = header.len() as u32;
        self.hdr.record_size = new_record_size as u32;
        self.hdr.encode_into(&mut header);
        self.header = header;
        self.records = RecordBuf::Owned(records);
        self.extensions = exts;
    }

    /// Adds a keyword to the index's table, growing the keyword header and
    /// bitmap as needed. Returns its bitmap position.
    pub(crate) fn add_keyword(&mut self, id: KeywordId) -> CoreResult<usize> {
        if let Some(idx) = self.keyword_index(id) {
            return Ok(idx);
        }
        let mut names = Vec::with_capacity(self.keyword_idx_map.len() + 1);
        for &known in self.keyword_idx_map.iter().chain(std::iter::once(&id)) {
            let name = self.registry.keyword_name(known).ok_or_else(|| {
                CoreError::invalid_operation(format!("keyword {known:?} not in registry"))
            })?;
            names.push(name);
        }
        let data = encode_keywords_header(&names);
        let bitmap = keyword_bitmap_size(names.len()) as u16;
        let ext_idx = self.ensure_ext(KEYWORDS_EXT_NAME, data.len() as u32, bitmap, 1, true);
        self.ext_header_mut(ext_idx)[..data.len()].copy_from_slice(&data);
        self.keyword_idx_map.push(id);
        Ok(self.keyword_idx_map.len() - 1)
    }

    /// Returns a message's keyword bitmap for modification.
    pub(crate) fn keyword_bitmap_mut(&mut self, seq: Seq) -> Option<&mut [u8]> {
        let idx = self.ext_index(KEYWORDS_EXT_NAME)?;
        self.ext_record_mut(seq, idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailindex_storage::BufferedIndex;

    fn empty() -> IndexMap {
        IndexMap::new_empty("test.index", 7, Registry::new())
    }

    fn with_messages(uids: &[u32]) -> IndexMap {
        let mut map = empty();
        map.hdr_mut().uid_validity = 1;
        for &uid in uids {
            map.push_record(uid, MailFlags::empty());
        }
        map.hdr_mut().next_uid = uids.last().map_or(1, |uid| uid + 1);
        map
    }

    fn reparse(map: &IndexMap) -> IndexMap {
        let bytes: Arc<dyn IndexBytes> = Arc::new(BufferedIndex::from_vec(map.encode()));
        IndexMap::from_bytes("test.index", bytes, map.registry().clone(), map.keywords()).unwrap()
    }

    #[test]
    fn empty_map_is_consistent() {
        let map = empty();
        assert_eq!(map.messages_count(), 0);
        assert_eq!(map.check_header(), ConsistencyLevel::Consistent);
        assert_eq!(map.encode().len(), 120);
    }

    #[test]
    fn uid_lookups() {
        let map = with_messages(&[3, 5, 9, 10]);
        assert_eq!(map.lookup_seq(9), Some(3));
        assert_eq!(map.lookup_seq(4), None);
        assert_eq!(map.lookup_seq_range(4, 9), Some((2, 3)));
        assert_eq!(map.lookup_seq_range(1, 2), None);
        assert_eq!(map.lookup_seq_range(11, 20), None);
        assert_eq!(map.lookup_seq_range(0, u32::MAX), Some((1, 4)));
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut map = with_messages(&[1, 2]);
        map.record_mut(2).unwrap()[4] = MailFlags::SEEN.bits();
        let idx = map.ensure_ext("cache", 4, 4, 4, false);
        map.ext_header_mut(idx).copy_from_slice(b"abcd");
        map.ext_record_mut(1, idx).unwrap().copy_from_slice(&[9, 9, 9, 9]);

        let parsed = reparse(&map);
        assert_eq!(parsed.header(), map.header());
        assert_eq!(parsed.record(2).unwrap().flags, MailFlags::SEEN);
        assert_eq!(parsed.ext_header("cache"), Some(&b"abcd"[..]));
        assert_eq!(parsed.ext_record(1, "cache"), Some(&[9, 9, 9, 9][..]));
        assert_eq!(parsed.ext_record(2, "cache"), Some(&[0, 0, 0, 0][..]));
    }

    #[test]
    fn relayout_preserves_data() {
        let mut map = with_messages(&[1, 2, 3]);
        let small = map.ensure_ext("small", 0, 2, 2, false);
        map.ext_record_mut(3, small).unwrap().copy_from_slice(&[1, 2]);
        let wide = map.ensure_ext("wide", 0, 8, 8, false);
        assert_eq!(map.record_size(), 24);
        map.ext_record_mut(3, wide).unwrap().copy_from_slice(&[7; 8]);

        // Growing the first extension moves the second one.
        map.ensure_ext("small", 0, 6, 2, false);
        assert_eq!(map.ext_record(3, "small"), Some(&[1, 2, 0, 0, 0, 0][..]));
        assert_eq!(map.ext_record(3, "wide"), Some(&[7; 8][..]));
        assert_eq!(map.uid(3), Some(3));

        // No-shrink keeps the larger size.
        map.ensure_ext("small", 0, 2, 2, true);
        assert_eq!(map.ext("small").unwrap().record_size, 6);
        assert_eq!(reparse(&map).ext_record(3, "wide"), Some(&[7; 8][..]));
    }

    #[test]
    fn keywords_grow_the_bitmap() {
        let mut map = with_messages(&[1]);
        let registry = map.registry().clone();
        let ids: Vec<_> = (0..33)
            .map(|i| registry.keyword_lookup_or_create(&format!("kw{i}")).unwrap())
            .collect();

        for &id in &ids[..2] {
            map.add_keyword(id).unwrap();
        }
        assert_eq!(map.ext("keywords").unwrap().record_size, 4);
        crate::index::keywords::bitmap_set(map.keyword_bitmap_mut(1).unwrap(), 1, true);

        for &id in &ids[2..] {
            map.add_keyword(id).unwrap();
        }
        assert_eq!(map.ext("keywords").unwrap().record_size, 8);
        assert_eq!(map.add_keyword(ids[0]).unwrap(), 0);

        let parsed = reparse(&map);
        assert_eq!(parsed.keywords(), &ids[..]);
        let set = parsed.message_keywords(1);
        assert_eq!(set.len(), 1);
        assert!(set.contains(ids[1]));
    }

    #[test]
    fn check_header_flags_broken_counters() {
        let mut map = with_messages(&[1, 2]);
        assert_eq!(map.check_header(), ConsistencyLevel::Consistent);

        map.hdr_mut().seen_messages_count = 3;
        assert!(matches!(map.check_header(), ConsistencyLevel::NeedsRebuild(_)));
        map.hdr_mut().seen_messages_count = 0;

        map.hdr_mut().next_uid = 2;
        assert!(matches!(map.check_header(), ConsistencyLevel::NeedsRebuild(_)));
        map.hdr_mut().next_uid = 3;

        map.hdr_mut().first_recent_uid = 0;
        assert!(matches!(map.check_header(), ConsistencyLevel::NeedsRebuild(_)));

        map.hdr_mut().minor_version = 2;
        assert_eq!(map.check_header(), ConsistencyLevel::NeedsUpgradeFixups);
    }

    #[test]
    fn messages_count_beyond_records_needs_rebuild() {
        let map = with_messages(&[1, 2]);
        let mut bytes = map.encode();
        bytes.truncate(bytes.len() - 8);
        let bytes: Arc<dyn IndexBytes> = Arc::new(BufferedIndex::from_vec(bytes));
        let parsed = IndexMap::from_bytes("t", bytes, Registry::new(), &[]).unwrap();
        assert!(matches!(parsed.check_header(), ConsistencyLevel::NeedsRebuild(_)));
    }

    #[test]
    fn upgrade_fixups_clear_recent() {
        let mut map = with_messages(&[1]);
        map.record_mut(1).unwrap()[4] = (MailFlags::RECENT | MailFlags::SEEN).bits();
        map.hdr_mut().minor_version = 2;
        map.hdr_mut().first_recent_uid = 0;
        map.apply_upgrade_fixups();
        assert_eq!(map.record(1).unwrap().flags, MailFlags::SEEN);
        assert_eq!(map.header().first_recent_uid, 1);
        assert_eq!(map.check_header(), ConsistencyLevel::Consistent);
    }

    #[test]
    fn header_update_cannot_move_layout() {
        let mut map = empty();
        map.update_header_bytes(24, &42u32.to_le_bytes()).unwrap();
        assert_eq!(map.header().uid_validity, 42);
        assert!(map.update_header_bytes(4, &[0xff; 4]).is_err());
        assert!(map.update_header_bytes(118, &[0; 4]).is_err());
    }

    #[test]
    fn clones_share_records_until_written() {
        let map = reparse(&with_messages(&[1, 2]));
        let mut copy = map.clone();
        copy.record_mut(1).unwrap()[4] = MailFlags::SEEN.bits();
        assert_eq!(map.record(1).unwrap().flags, MailFlags::empty());
        assert_eq!(copy.record(1).unwrap().flags, MailFlags::SEEN);
    }
}
