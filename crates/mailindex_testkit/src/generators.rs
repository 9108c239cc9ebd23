//! Property-based test generators using proptest.
//!
//! Provides strategies for flags, keywords and whole sequences of index
//! operations. Operations pick their messages through
//! [`prop::sample::Index`] so that a sequence stays valid however many
//! messages earlier operations left behind.

use mailindex_core::{Guid, MailFlags, ModifyType};
use proptest::prelude::*;
use proptest::sample::Index;

/// Strategy for the flags a client may set: `\Answered` through `\Draft`.
pub fn mail_flags_strategy() -> impl Strategy<Value = MailFlags> {
    (0u8..0x20).prop_map(MailFlags::from_bits_truncate)
}

/// Strategy for flag and keyword modify modes.
pub fn modify_type_strategy() -> impl Strategy<Value = ModifyType> {
    prop_oneof![
        Just(ModifyType::Add),
        Just(ModifyType::Remove),
        Just(ModifyType::Replace),
    ]
}

/// Strategy for keyword names, up to 50 characters.
pub fn keyword_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z$][A-Za-z0-9_]{0,49}").expect("Invalid regex")
}

/// Strategy for message GUIDs, including the all-zero "no GUID".
pub fn guid_strategy() -> impl Strategy<Value = Guid> {
    prop_oneof![
        1 => Just([0u8; 16]),
        3 => prop::array::uniform16(any::<u8>()),
    ]
}

/// One committed change to an index.
#[derive(Debug, Clone)]
pub enum IndexOp {
    /// Append `count` messages with `flags`.
    Append {
        /// Number of messages.
        count: u32,
        /// Initial flags.
        flags: MailFlags,
    },
    /// Expunge one message.
    Expunge {
        /// The message.
        pick: Index,
        /// Its GUID.
        guid: Guid,
    },
    /// Change flags on a range of messages.
    Flags {
        /// One end of the range.
        first: Index,
        /// The other end.
        second: Index,
        /// How the flags combine.
        mode: ModifyType,
        /// The flags.
        flags: MailFlags,
    },
    /// Change one keyword on one message.
    Keyword {
        /// The message.
        pick: Index,
        /// Index into the keyword pool.
        keyword: usize,
        /// How the keyword combines.
        mode: ModifyType,
    },
}

impl IndexOp {
    /// Resolves `pick` against an index holding `count` messages.
    pub fn seq(pick: &Index, count: u32) -> u32 {
        pick.index(count as usize) as u32 + 1
    }
}

/// Keyword names the generated operations draw from.
pub const KEYWORD_POOL: [&str; 4] = [
    "$Junk",
    "$Forwarded",
    "work",
    "a_rather_long_keyword_name_for_a_single_message_xy",
];

/// Strategy for one index operation.
pub fn index_op_strategy() -> impl Strategy<Value = IndexOp> {
    prop_oneof![
        3 => (1u32..5, mail_flags_strategy())
            .prop_map(|(count, flags)| IndexOp::Append { count, flags }),
        1 => (any::<Index>(), guid_strategy())
            .prop_map(|(pick, guid)| IndexOp::Expunge { pick, guid }),
        3 => (any::<Index>(), any::<Index>(), modify_type_strategy(), mail_flags_strategy())
            .prop_map(|(first, second, mode, flags)| IndexOp::Flags { first, second, mode, flags }),
        2 => (any::<Index>(), 0..KEYWORD_POOL.len(), modify_type_strategy())
            .prop_map(|(pick, keyword, mode)| IndexOp::Keyword { pick, keyword, mode }),
    ]
}

/// Strategy for a sequence of up to `max_len` operations.
pub fn index_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<IndexOp>> {
    prop::collection::vec(index_op_strategy(), 1..=max_len)
}
