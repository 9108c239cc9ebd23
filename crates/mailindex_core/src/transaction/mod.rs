//! Staging index changes and turning them into log records.
//!
//! A [`Transaction`] collects changes in memory against the map it was
//! started on. Committing it exports the changes as one framed log
//! transaction; until then nothing is visible to anyone.

mod builder;
mod export;
mod flags;

use bitflags::bitflags;

pub use builder::Transaction;
pub(crate) use export::export;
pub use flags::{FlagRange, FlagRanges};

bitflags! {
    /// Options for a whole transaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        /// The changes were already made in the backend storage; every
        /// record is marked external.
        const EXTERNAL = 0x01;
        /// The transaction is written by a backend sync.
        const SYNC = 0x02;
        /// Force the log append to stable storage even when the fsync mode
        /// only syncs on request.
        const FSYNC = 0x04;
    }
}
