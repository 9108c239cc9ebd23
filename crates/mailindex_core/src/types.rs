//! Core type definitions.

use bitflags::bitflags;
use std::time::{SystemTime, UNIX_EPOCH};

/// A message sequence number: 1-based position in the index.
pub type Seq = u32;

/// A message UID: stable, strictly increasing per mailbox.
pub type Uid = u32;

/// A 128-bit message GUID, carried with expunges for verification.
pub type Guid = [u8; 16];

/// A modification sequence.
pub type Modseq = u64;

bitflags! {
    /// Per-message system flags stored in the base record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MailFlags: u8 {
        /// `\Answered`
        const ANSWERED = 0x01;
        /// `\Flagged`
        const FLAGGED = 0x02;
        /// `\Deleted`
        const DELETED = 0x04;
        /// `\Seen`
        const SEEN = 0x08;
        /// `\Draft`
        const DRAFT = 0x10;
        /// Historical `\Recent` bit. Only ever cleared by upgrade fixups.
        const RECENT = 0x20;
        /// Backend-private flag.
        const BACKEND = 0x40;
        /// The backend storage has not caught up with this flag change.
        const DIRTY = 0x80;
    }
}

/// How a flag or keyword change combines with the existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyType {
    /// Set the given flags, keep the rest.
    Add,
    /// Clear the given flags, keep the rest.
    Remove,
    /// Set exactly the given flags.
    Replace,
}

/// Returns the current time in whole seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as u32)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
