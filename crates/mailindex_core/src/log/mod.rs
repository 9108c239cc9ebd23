//! Transaction log: record formats, the file arena, the writer and views.
//!
//! The log is a chain of append-only files. `<prefix>.log` is the head;
//! rotation renames it to `<prefix>.log.2` and starts a new head whose
//! header links back to where the old one ended.

pub mod format;
pub mod records;

mod append;
mod file;
mod transaction_log;
mod view;

pub use append::{LogAppend, LogSpan};
pub use format::{LogFileHeader, RecordHeader, RecordKind, RecordType};
pub use transaction_log::{LogPosition, TransactionLog};
pub use view::LogView;
