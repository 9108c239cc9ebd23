//! # mailindex testkit
//!
//! Test utilities for the mailbox index engine.
//!
//! This crate provides:
//! - Fixtures: temporary index directories and pre-populated indexes
//! - Property-based generators for flags, keywords and index operations
//! - A reference model that index maps are checked against
//! - Crash helpers that tear or half-write the transaction log
//! - Concurrency scenarios with several handles on one index
//!
//! ## Usage
//!
//! ```rust
//! use mailindex_testkit::prelude::*;
//!
//! let index = TestIndex::memory();
//! append_messages(&index, 3);
//! assert_eq!(index.map().messages_count(), 3);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
