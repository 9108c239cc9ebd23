//! Storage backend trait definition.

use crate::error::StorageResult;

/// A positioned byte store.
///
/// Backends are **opaque byte stores**. The transaction log writes records
/// at explicit offsets (the size field of a record is patched in place after
/// the payload is durable), so unlike an append-only store every write names
/// its offset.
///
/// # Invariants
///
/// - `write_at` never leaves a hole: `offset <= size()`
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` makes all previous writes durable
/// - Backends must be `Send + Sync`
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing and in-memory fallback
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read would extend beyond the current size or
    /// an I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, extending the store when needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` is beyond the current size or an I/O
    /// error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Re-reads the size from the underlying medium.
    ///
    /// Other processes append to shared files, so a cached size goes stale.
    /// Stores that cannot change behind the caller's back return `size()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn refresh_size(&self) -> StorageResult<u64> {
        self.size()
    }

    /// Forces all written data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to the given size.
    ///
    /// Used to discard a partially written record after a failed write.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails or `new_size` is greater
    /// than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Returns true if the data lives only in process memory.
    fn is_in_memory(&self) -> bool {
        false
    }
}
