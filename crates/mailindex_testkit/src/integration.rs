//! Cross-module integration test helpers.
//!
//! [`IndexModel`] is a plain in-memory picture of a mailbox. Applying the
//! same [`IndexOp`]s to a model and to a real index and comparing the two
//! exercises the transaction builder, the log writer and replay together.

use crate::generators::{IndexOp, KEYWORD_POOL};
use mailindex_core::types::Uid;
use mailindex_core::{IndexMap, MailFlags, MailIndex, ModifyType, TransactionFlags};
use std::collections::BTreeSet;

/// One message as the model sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMessage {
    /// The message UID.
    pub uid: Uid,
    /// System flags.
    pub flags: MailFlags,
    /// Keyword names.
    pub keywords: BTreeSet<String>,
}

/// Expected mailbox state.
#[derive(Debug, Clone)]
pub struct IndexModel {
    messages: Vec<ModelMessage>,
    next_uid: Uid,
}

impl IndexModel {
    /// Creates the model of an empty mailbox.
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            next_uid: 1,
        }
    }

    /// Returns the modelled messages in sequence order.
    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    /// Applies `op` to both the model and `index`, one transaction per
    /// operation. Operations that need a message are skipped on an empty
    /// mailbox.
    pub fn apply(&mut self, index: &MailIndex, op: &IndexOp) {
        let count = self.messages.len() as u32;
        let mut tx = index.transaction_begin(TransactionFlags::empty());
        match op {
            IndexOp::Append { count: n, flags } => {
                for _ in 0..*n {
                    let seq = tx.append(0);
                    if !flags.is_empty() {
                        tx.update_flags(seq, seq, ModifyType::Add, *flags);
                    }
                    self.messages.push(ModelMessage {
                        uid: self.next_uid,
                        flags: *flags,
                        keywords: BTreeSet::new(),
                    });
                    self.next_uid += 1;
                }
            }
            IndexOp::Expunge { pick, guid } => {
                if count == 0 {
                    return;
                }
                let seq = IndexOp::seq(pick, count);
                tx.expunge(seq, *guid);
                self.messages.remove(seq as usize - 1);
            }
            IndexOp::Flags {
                first,
                second,
                mode,
                flags,
            } => {
                if count == 0 {
                    return;
                }
                let a = IndexOp::seq(first, count);
                let b = IndexOp::seq(second, count);
                let (seq1, seq2) = (a.min(b), a.max(b));
                tx.update_flags(seq1, seq2, *mode, *flags);
                for msg in &mut self.messages[seq1 as usize - 1..seq2 as usize] {
                    msg.flags = match mode {
                        ModifyType::Add => msg.flags | *flags,
                        ModifyType::Remove => msg.flags - *flags,
                        ModifyType::Replace => *flags,
                    };
                }
            }
            IndexOp::Keyword { pick, keyword, mode } => {
                if count == 0 {
                    return;
                }
                let seq = IndexOp::seq(pick, count);
                let name = KEYWORD_POOL[*keyword];
                let set = index
                    .registry()
                    .keywords_create(&[name])
                    .expect("Failed to create keyword");
                tx.update_keywords(seq, *mode, &set);
                let keywords = &mut self.messages[seq as usize - 1].keywords;
                match mode {
                    ModifyType::Add => {
                        keywords.insert(name.to_string());
                    }
                    ModifyType::Remove => {
                        keywords.remove(name);
                    }
                    ModifyType::Replace => {
                        keywords.clear();
                        keywords.insert(name.to_string());
                    }
                }
            }
        }
        index.commit(tx).expect("Failed to commit transaction");
    }

    /// Asserts that `map` holds exactly the modelled state.
    pub fn verify(&self, map: &IndexMap) {
        let hdr = map.header();
        assert_eq!(map.messages_count() as usize, self.messages.len(), "messages count");
        assert_eq!(hdr.next_uid, self.next_uid, "next_uid");

        let seen = self.count_with(MailFlags::SEEN);
        let deleted = self.count_with(MailFlags::DELETED);
        assert_eq!(hdr.seen_messages_count, seen, "seen count");
        assert_eq!(hdr.deleted_messages_count, deleted, "deleted count");
        if let Some(first_unseen) = self.first_uid_without(MailFlags::SEEN) {
            assert!(hdr.first_unseen_uid_lowwater <= first_unseen, "unseen low-water mark");
        }

        for (i, expected) in self.messages.iter().enumerate() {
            let seq = i as u32 + 1;
            let rec = map.record(seq).expect("Missing record");
            assert_eq!(rec.uid, expected.uid, "uid of seq {seq}");
            assert_eq!(rec.flags, expected.flags, "flags of uid {}", expected.uid);

            let keywords: BTreeSet<String> = map
                .message_keywords(seq)
                .iter()
                .filter_map(|id| map.registry().keyword_name(id))
                .collect();
            assert_eq!(keywords, expected.keywords, "keywords of uid {}", expected.uid);
        }
    }

    fn count_with(&self, flag: MailFlags) -> u32 {
        self.messages
            .iter()
            .filter(|msg| msg.flags.contains(flag))
            .count() as u32
    }

    fn first_uid_without(&self, flag: MailFlags) -> Option<Uid> {
        self.messages
            .iter()
            .find(|msg| !msg.flags.contains(flag))
            .map(|msg| msg.uid)
    }
}

impl Default for IndexModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{append_messages, expunge_range, modify_flags, TestIndex};
    use crate::generators::index_ops_strategy;
    use mailindex_core::Config;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn explicit_uids_and_seen_flags_survive_reopen() {
        let mut index = TestIndex::file();
        assert_eq!(index.map().header().next_uid, 1);

        let mut tx = index.transaction_begin(TransactionFlags::empty());
        tx.append(100);
        tx.append(101);
        assert_eq!(index.commit(tx).unwrap().uids, Some((100, 101)));
        modify_flags(&index, 1, 2, ModifyType::Add, MailFlags::SEEN);
        index.reopen();

        let map = index.map();
        assert_eq!(map.messages_count(), 2);
        assert_eq!(map.header().next_uid, 102);
        assert_eq!(map.header().seen_messages_count, 2);
        for seq in 1..=2 {
            let rec = map.record(seq).unwrap();
            assert_eq!(rec.uid, 99 + seq);
            assert!(rec.flags.contains(MailFlags::SEEN));
        }
    }

    #[test]
    fn seen_flags_on_101_messages_survive_reopen() {
        let mut index = TestIndex::file();
        assert_eq!(append_messages(&index, 101), Some((1, 101)));
        modify_flags(&index, 1, 100, ModifyType::Add, MailFlags::SEEN);
        index.reopen();

        let map = index.map();
        assert_eq!(map.messages_count(), 101);
        assert_eq!(map.header().seen_messages_count, 100);
        assert!(map.record(100).unwrap().flags.contains(MailFlags::SEEN));
        assert!(!map.record(101).unwrap().flags.contains(MailFlags::SEEN));
    }

    #[test]
    fn expunging_the_newest_messages_keeps_next_uid() {
        let mut index = TestIndex::file();
        append_messages(&index, 10);
        expunge_range(&index, 8, 10);
        assert_eq!(index.map().messages_count(), 7);
        assert_eq!(index.map().header().next_uid, 11);

        index.reopen();
        assert_eq!(index.map().uid(7), Some(7));
        assert_eq!(append_messages(&index, 1), Some((11, 11)));
    }

    #[test]
    fn long_keyword_survives_reopen() {
        let mut index = TestIndex::file();
        append_messages(&index, 2);
        let name = "k".repeat(50);
        let set = index.registry.keywords_create(&[name.as_str()]).unwrap();
        let mut tx = index.transaction_begin(TransactionFlags::empty());
        tx.update_keywords(2, ModifyType::Add, &set);
        index.commit(tx).unwrap();

        index.reopen();
        let map = index.map();
        let ids: Vec<_> = map.message_keywords(2).iter().collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(map.registry().keyword_name(ids[0]).as_deref(), Some(name.as_str()));
        assert!(map.message_keywords(1).is_empty());
    }

    #[test]
    fn extension_data_survives_reopen() {
        let mut index = TestIndex::file();
        let ext = index.registry.register_ext("cache", 16, 8, 8);
        append_messages(&index, 3);

        let mut tx = index.transaction_begin(TransactionFlags::empty());
        tx.update_ext_header(ext, 4, &[1, 2, 3, 4]);
        tx.update_ext_record(ext, 1, &[9; 8]);
        tx.atomic_inc_ext(ext, 2, 5);
        index.commit(tx).unwrap();

        let mut tx = index.transaction_begin(TransactionFlags::empty());
        tx.atomic_inc_ext(ext, 2, -2);
        index.commit(tx).unwrap();

        index.reopen();
        let map = index.map();
        assert_eq!(&map.ext_header("cache").unwrap()[4..8], &[1, 2, 3, 4]);
        assert_eq!(map.ext_record(1, "cache").unwrap(), &[9; 8]);
        assert_eq!(map.ext_record(2, "cache").unwrap(), &3u64.to_le_bytes());
        assert_eq!(map.ext_record(3, "cache").unwrap(), &[0; 8]);
    }

    #[test]
    fn rotated_log_still_serves_other_handles() {
        let config = Config::default().log_rotate(0, 256, Duration::ZERO);
        let mut index = TestIndex::file_with(config);
        let other = index.open_another();
        for _ in 0..10 {
            append_messages(&index, 1);
        }
        assert!(index.log().head_hdr().file_seq > 1);
        let mut old = index.log_path().unwrap().into_os_string();
        old.push(".2");
        assert!(std::path::Path::new(&old).exists());

        assert!(other.refresh().unwrap());
        assert_eq!(other.map().messages_count(), 10);
        assert_eq!(other.map().uid(10), Some(10));

        index.reopen();
        assert_eq!(index.map().messages_count(), 10);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn memory_index_matches_model(ops in index_ops_strategy(24)) {
            let index = TestIndex::memory();
            let mut model = IndexModel::new();
            for op in &ops {
                model.apply(&index, op);
            }
            model.verify(&index.map());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn reopened_index_matches_model(ops in index_ops_strategy(12)) {
            let mut index = TestIndex::file();
            let other = index.open_another();
            let mut model = IndexModel::new();
            for op in &ops {
                model.apply(&index, op);
            }

            other.refresh().unwrap();
            model.verify(&other.map());
            index.reopen();
            model.verify(&index.map());
        }
    }
}
