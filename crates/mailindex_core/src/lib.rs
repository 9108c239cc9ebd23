//! # mailindex core
//!
//! The on-disk mailbox index storage engine.
//!
//! For every mailbox the engine keeps a compact binary snapshot of message
//! metadata (the *index*) plus a write-ahead *transaction log* of every
//! change made since the snapshot was written. Several independent processes
//! may read and write the same files.
//!
//! This crate provides:
//! - [`lock::LockManager`] - shared/exclusive index locking with lock
//!   generations
//! - [`index`] - the index header, record layout, extension and keyword
//!   tables and the immutable [`IndexMap`]
//! - [`Registry`] - process-wide extension and keyword registrations
//! - [`Transaction`] - in-memory staging of appends, expunges, flag,
//!   keyword, extension and header changes
//! - [`log`] - the transaction log: file chain, durable appends and
//!   replayable [`LogView`]s
//! - [`MailIndex`] - the facade protocol layers use: open, refresh, commit,
//!   write the index
//!
//! ## Example
//!
//! ```rust
//! use mailindex_core::{MailFlags, MailIndex, ModifyType, Registry, TransactionFlags};
//!
//! let index = MailIndex::open_in_memory(Registry::new());
//!
//! let mut tx = index.transaction_begin(TransactionFlags::empty());
//! tx.append(0);
//! tx.append(0);
//! index.commit(tx).unwrap();
//!
//! let mut tx = index.transaction_begin(TransactionFlags::empty());
//! tx.update_flags(1, 2, ModifyType::Add, MailFlags::SEEN);
//! index.commit(tx).unwrap();
//!
//! let map = index.map();
//! assert_eq!(map.messages_count(), 2);
//! assert!(map.record(1).unwrap().flags.contains(MailFlags::SEEN));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod index;
pub mod lock;
pub mod log;
mod mail_index;
pub mod registry;
pub mod seq_range;
pub mod sync;
pub mod transaction;
pub mod types;

pub use config::{Config, FsyncMode};
pub use error::{CoreError, CoreResult};
pub use index::{ConsistencyLevel, IndexHeader, IndexMap, MessageRecord};
pub use lock::{LockId, LockManager, LockMethod};
pub use log::{LogView, RecordHeader, RecordType, TransactionLog};
pub use mail_index::{CommitResult, MailIndex};
pub use registry::{ExtId, KeywordId, KeywordSet, Registry};
pub use transaction::{Transaction, TransactionFlags};
pub use types::{Guid, MailFlags, ModifyType};

pub use mailindex_storage::AccessStrategy;
