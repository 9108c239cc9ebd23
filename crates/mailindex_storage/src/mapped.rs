//! Index access strategies.
//!
//! The index file can be accessed either through a memory mapping or by
//! reading it into a private buffer. Parsing code only ever sees a byte
//! slice through [`IndexBytes`], so it does not care which one is active.

use crate::error::StorageResult;
use memmap2::Mmap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

/// How the index file is brought into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessStrategy {
    /// Memory-map the file.
    #[default]
    Mmap,
    /// Read the whole file into an owned buffer.
    Read,
}

/// A read-only view of index file bytes.
///
/// Implementations must return the same bytes for the lifetime of the value.
pub trait IndexBytes: Send + Sync + fmt::Debug {
    /// Returns the file contents.
    fn bytes(&self) -> &[u8];

    /// Returns the strategy that produced these bytes.
    fn strategy(&self) -> AccessStrategy;

    /// Returns the number of bytes.
    fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Returns true if the file was empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index bytes backed by a read-only memory mapping.
pub struct MappedIndex {
    map: Mmap,
}

impl MappedIndex {
    /// Maps the whole file.
    ///
    /// The caller must hold at least a shared lock on the file while the
    /// mapping is parsed: a writer truncating the file underneath would
    /// otherwise fault the reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be created.
    #[allow(unsafe_code)]
    pub fn map(file: &File) -> StorageResult<Self> {
        // SAFETY: index files are only rewritten in place under an exclusive
        // lock and are otherwise replaced by rename, never truncated while
        // readers hold the shared lock.
        let map = unsafe { Mmap::map(file)? };
        Ok(Self { map })
    }
}

impl fmt::Debug for MappedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedIndex")
            .field("len", &self.map.len())
            .finish()
    }
}

impl IndexBytes for MappedIndex {
    fn bytes(&self) -> &[u8] {
        &self.map
    }

    fn strategy(&self) -> AccessStrategy {
        AccessStrategy::Mmap
    }
}

/// Index bytes read into a private buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferedIndex {
    data: Vec<u8>,
}

impl BufferedIndex {
    /// Reads the whole file from the beginning.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn read(mut file: &File) -> StorageResult<Self> {
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;
        Ok(Self { data })
    }

    /// Wraps bytes that are already in memory.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl IndexBytes for BufferedIndex {
    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn strategy(&self) -> AccessStrategy {
        AccessStrategy::Read
    }
}

/// Brings an opened index file into memory using `strategy`.
///
/// # Errors
///
/// Returns an error if mapping or reading fails.
pub fn open_index_bytes(file: &File, strategy: AccessStrategy) -> StorageResult<Arc<dyn IndexBytes>> {
    Ok(match strategy {
        AccessStrategy::Mmap => Arc::new(MappedIndex::map(file)?),
        AccessStrategy::Read => Arc::new(BufferedIndex::read(file)?),
    })
}
