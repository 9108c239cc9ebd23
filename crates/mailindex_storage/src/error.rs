//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A write would leave a hole before the current end of storage.
    #[error("write would leave a gap: offset {offset}, size {size}")]
    WriteGap {
        /// The requested write offset.
        offset: u64,
        /// The current storage size.
        size: u64,
    },

    /// Truncation to a size larger than the current one was requested.
    #[error("cannot truncate to {new_size}, storage is only {size} bytes")]
    TruncateGrow {
        /// Requested size.
        new_size: u64,
        /// Current size.
        size: u64,
    },
}

impl StorageError {
    /// Returns true if this error was caused by the disk being full or a
    /// quota being exceeded.
    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        match self {
            Self::Io(e) => matches!(e.raw_os_error(), Some(28) | Some(122)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_space_is_recognized() {
        assert!(StorageError::Io(io::Error::from_raw_os_error(28)).is_out_of_space());
        assert!(!StorageError::Io(io::Error::from(io::ErrorKind::NotFound)).is_out_of_space());
        assert!(!StorageError::WriteGap { offset: 8, size: 4 }.is_out_of_space());
    }
}
