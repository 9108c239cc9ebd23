//! The index file: header, record layout, extensions, keywords and the
//! in-memory [`IndexMap`].
//!
//! The file starts with the base header, followed by the extension area
//! (up to `header_size`) and then `messages_count` fixed-size records.

pub mod ext;
pub mod header;
pub mod keywords;

mod file;
mod map;

pub use ext::MapExt;
pub use file::IndexFile;
pub use header::{check_header_compat, HeaderFlags, IndexHeader};
pub use map::{ConsistencyLevel, IndexMap, MessageRecord};
