//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// Writes are positioned: the caller names the offset of every write, which
/// lets the transaction log patch a record's size field after the payload
/// has been written.
///
/// # Durability
///
/// - `sync()` calls `File::sync_data()` so written data is on stable storage
///
/// # Thread Safety
///
/// The file handle sits behind a lock so seek+read and seek+write pairs are
/// never interleaved.
///
/// # Example
///
/// ```no_run
/// use mailindex_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("mailindex.log")).unwrap();
/// backend.write_at(0, b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file)
    }

    /// Opens an existing file, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open_existing(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(path, file)
    }

    /// Wraps an already opened file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file size cannot be read.
    pub fn from_file(path: &Path, file: File) -> StorageResult<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut file = self.file.write();
        let mut size = self.size.write();

        if offset > *size {
            return Err(StorageError::WriteGap {
                offset,
                size: *size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size = (*size).max(offset + data.len() as u64);

        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn refresh_size(&self) -> StorageResult<u64> {
        let len = self.file.read().metadata()?.len();
        *self.size.write() = len;
        Ok(len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let file = self.file.write();
        file.sync_data()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::TruncateGrow {
                new_size,
                size: *size,
            });
        }

        file.set_len(new_size)?;
        *size = new_size;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"hello").unwrap();
        backend.write_at(5, b" world").unwrap();
        assert_eq!(backend.size().unwrap(), 11);

        let data = backend.read_at(0, 11).unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn file_patch_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, &[0, 0, 0, 0, 9, 9]).unwrap();
        backend.write_at(0, &[1, 2, 3, 4]).unwrap();

        assert_eq!(backend.size().unwrap(), 6);
        assert_eq!(backend.read_at(0, 6).unwrap(), vec![1, 2, 3, 4, 9, 9]);
    }

    #[test]
    fn file_write_gap_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let mut backend = FileBackend::open(&path).unwrap();
        let result = backend.write_at(4, b"x");
        assert!(matches!(result, Err(StorageError::WriteGap { .. })));
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"hello").unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.write_at(0, b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open_existing(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 15);
        assert_eq!(&backend.read_at(0, 15).unwrap(), b"persistent data");
    }

    #[test]
    fn file_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, b"hello world").unwrap();
        backend.truncate(5).unwrap();
        assert_eq!(backend.size().unwrap(), 5);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5);

        assert!(matches!(
            backend.truncate(50),
            Err(StorageError::TruncateGrow { .. })
        ));
    }

    #[test]
    fn refresh_size_sees_external_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let backend = FileBackend::open(&path).unwrap();
        let mut other = FileBackend::open(&path).unwrap();
        other.write_at(0, b"grown elsewhere").unwrap();

        assert_eq!(backend.size().unwrap(), 0);
        assert_eq!(backend.refresh_size().unwrap(), 15);
        assert_eq!(&backend.read_at(0, 5).unwrap(), b"grown");
    }

    #[test]
    fn open_existing_fails_for_missing_file() {
        let dir = tempdir().unwrap();
        let result = FileBackend::open_existing(&dir.path().join("missing"));
        assert!(matches!(result, Err(StorageError::Io(_))));
    }
}
