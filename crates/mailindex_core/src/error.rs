//! Error types for the index engine.
//!
//! Corruption, timeouts and I/O failures are returned as values so the
//! caller can decide between rebuilding, retrying or dropping the session.
//! Broken internal contracts (expunging a non-final append, committing a
//! malformed flag range) are not errors: they panic.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in index engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] mailindex_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The index file violates a structural invariant.
    #[error("corrupted index file {}: {message}", path.display())]
    IndexCorrupted {
        /// Index file path.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    /// A transaction log file violates a structural invariant.
    #[error("corrupted transaction log file {} at offset {offset} (record type {record_type:#x}): {message}", path.display())]
    LogCorrupted {
        /// Log file path.
        path: PathBuf,
        /// Offset of the offending record or header.
        offset: u64,
        /// Raw record type, zero when the file header is at fault.
        record_type: u32,
        /// Description of the corruption, including expected vs. actual
        /// sizes where relevant.
        message: String,
    },

    /// The requested log range is no longer available; the caller should
    /// rebuild the index from what remains.
    #[error("transaction log history lost at file seq {file_seq}: {reason}")]
    LogHistoryLost {
        /// The file sequence that could not be found.
        file_seq: u32,
        /// Why the range cannot be served.
        reason: String,
    },

    /// A shared lock could not be acquired within the timeout.
    #[error("timed out waiting for lock on {}", path.display())]
    LockTimeout {
        /// Locked file path.
        path: PathBuf,
    },

    /// A non-blocking exclusive lock attempt failed.
    #[error("lock on {} is held by someone else", path.display())]
    LockWouldBlock {
        /// Locked file path.
        path: PathBuf,
    },

    /// The log view saw corruption earlier and can no longer be used.
    #[error("log view is broken by earlier corruption")]
    ViewBroken,

    /// A bounds-checked read fell outside the buffer.
    #[error("read out of bounds: offset {offset}, len {len}, size {size}")]
    OutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Buffer size.
        size: usize,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an index corruption error.
    pub fn index_corrupted(path: &Path, message: impl Into<String>) -> Self {
        Self::IndexCorrupted {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corrupted(
        path: &Path,
        offset: u64,
        record_type: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::LogCorrupted {
            path: path.to_path_buf(),
            offset,
            record_type,
            message: message.into(),
        }
    }

    /// Creates a history-lost error.
    pub fn history_lost(file_seq: u32, reason: impl Into<String>) -> Self {
        Self::LogHistoryLost {
            file_seq,
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for on-disk corruption of either file kind.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::IndexCorrupted { .. } | Self::LogCorrupted { .. } | Self::ViewBroken
        )
    }

    /// Returns true if the log can no longer serve a requested range.
    #[must_use]
    pub fn is_history_lost(&self) -> bool {
        matches!(self, Self::LogHistoryLost { .. })
    }

    /// Returns true if an exclusive lock attempt would have blocked.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::LockWouldBlock { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_message_carries_context() {
        let err = CoreError::log_corrupted(Path::new("/tmp/x.log"), 96, 0x2, "size 7 < 8");
        let text = err.to_string();
        assert!(text.contains("/tmp/x.log"));
        assert!(text.contains("offset 96"));
        assert!(text.contains("0x2"));
        assert!(err.is_corruption());
    }

    #[test]
    fn timeout_is_not_corruption() {
        let err = CoreError::LockTimeout {
            path: PathBuf::from("idx"),
        };
        assert!(!err.is_corruption());
        assert!(!err.is_would_block());
    }
}
