//! # mailindex storage
//!
//! Byte-store backends and index access strategies for the mail index engine.
//!
//! This crate provides the lowest-level storage abstraction. Backends are
//! **opaque byte stores** - they do not interpret the data they hold.
//!
//! ## Design Principles
//!
//! - Backends are positioned byte stores (read at, write at, truncate, sync)
//! - No knowledge of index headers, log records or extensions
//! - Must be `Send + Sync` so a log file can be shared with views
//! - The core crate owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests, in-memory indexes and the log's
//!   write-failure fallback
//! - [`FileBackend`] - For persistent storage using positioned OS I/O
//!
//! ## Index Access Strategies
//!
//! The index file is parsed from a byte slice obtained through the
//! [`IndexBytes`] trait. Two interchangeable strategies exist:
//!
//! - [`MappedIndex`] - memory-maps the file
//! - [`BufferedIndex`] - reads the file into an owned buffer
//!
//! ## Example
//!
//! ```rust
//! use mailindex_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.write_at(0, b"hello world").unwrap();
//! let data = backend.read_at(6, 5).unwrap();
//! assert_eq!(&data, b"world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod mapped;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use mapped::{open_index_bytes, AccessStrategy, BufferedIndex, IndexBytes, MappedIndex};
pub use memory::InMemoryBackend;
