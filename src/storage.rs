//! Storage abstraction layer for whorl.
//!
//! The index never touches the filesystem directly. Everything goes through
//! the [`Storage`] trait, which models a flat virtual directory: files can be
//! created, opened, listed, deleted and renamed, and named advisory locks can
//! be taken. Committed index files are immutable, so readers usually map a
//! whole file at once through [`Storage::open_bytes`] and decode it in place.
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage
//! - Memory-mapped reads (`memmap2`) for [`Storage::open_bytes`]
//! - Lock files created with `create_new`
//!
//! ## MemoryStorage
//! - In-memory storage for tests and throwaway indexes
//!
//! # Example
//!
//! ```
//! use whorl::storage::{StorageConfig, StorageFactory};
//! use whorl::storage::memory::MemoryStorageConfig;
//! use std::io::Write;
//!
//! # fn main() -> whorl::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! let mut output = storage.create_output("_main_1.toc")?;
//! output.write_all(b"toc")?;
//! output.close()?;
//!
//! let bytes = storage.open_bytes("_main_1.toc")?;
//! assert_eq!(bytes.as_slice(), b"toc");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, WhorlError};

pub mod file;
pub mod memory;
pub mod structured;

/// A trait for storage backends that can store and retrieve files.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Open a file for sequential reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Map the whole file as an immutable byte view.
    ///
    /// This is how committed index files are read: the returned [`FileBytes`]
    /// can be sliced and shared without copying.
    fn open_bytes(&self, name: &str) -> Result<FileBytes>;

    /// Create a file for writing, truncating any existing file.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Rename a file.
    ///
    /// When `overwrite` is false and `new_name` already exists, the rename
    /// fails with [`StorageError::FileExists`] and nothing changes. Writing a
    /// temporary file and renaming it into place is how the index publishes
    /// new generations.
    fn rename_file(&self, old_name: &str, new_name: &str, overwrite: bool) -> Result<()>;

    /// Create a uniquely named file whose name starts with `prefix`.
    fn create_temp_output(&self, prefix: &str) -> Result<(String, Box<dyn StorageOutput>)>;

    /// Try to take the named advisory lock. Returns `None` if another holder has it.
    fn try_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>> {
        Err(StorageError::InvalidOperation(format!("locking is not supported: {name}")).into())
    }

    /// Sync all pending writes to storage.
    fn sync(&self) -> Result<()>;

    /// Close the storage and release its locks.
    fn close(&mut self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream. The file becomes visible under its name.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// A named advisory lock. Dropping the lock releases it.
pub trait StorageLock: Send + fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// An immutable, cheaply clonable view over (part of) a file's bytes.
///
/// The backing buffer is either a memory map or an owned buffer; slices share
/// the same backing storage.
#[derive(Clone)]
pub struct FileBytes {
    data: Arc<dyn AsRef<[u8]> + Send + Sync>,
    start: usize,
    end: usize,
}

impl FileBytes {
    /// Wrap any owned byte container.
    pub fn new<T: AsRef<[u8]> + Send + Sync + 'static>(data: T) -> Self {
        let end = data.as_ref().len();
        FileBytes {
            data: Arc::new(data),
            start: 0,
            end,
        }
    }

    /// An empty view.
    pub fn empty() -> Self {
        FileBytes::new(Vec::<u8>::new())
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &AsRef::<[u8]>::as_ref(&*self.data)[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// A sub-view relative to this view.
    pub fn slice(&self, range: Range<usize>) -> Result<FileBytes> {
        if range.start > range.end || range.end > self.len() {
            return Err(WhorlError::format(format!(
                "slice {}..{} out of bounds for {} bytes",
                range.start,
                range.end,
                self.len()
            )));
        }
        Ok(FileBytes {
            data: Arc::clone(&self.data),
            start: self.start + range.start,
            end: self.start + range.end,
        })
    }

    /// Borrow a range of the view, failing instead of panicking when out of bounds.
    pub fn get(&self, range: Range<usize>) -> Result<&[u8]> {
        self.as_slice().get(range.clone()).ok_or_else(|| {
            WhorlError::format(format!(
                "read {}..{} past the end of {} bytes",
                range.start,
                range.end,
                self.len()
            ))
        })
    }

    pub fn read_u8(&self, pos: usize) -> Result<u8> {
        Ok(self.get(pos..pos + 1)?[0])
    }

    pub fn read_u16_be(&self, pos: usize) -> Result<u16> {
        Ok(byteorder::BigEndian::read_u16(self.get(pos..pos + 2)?))
    }

    pub fn read_u32(&self, pos: usize) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.get(pos..pos + 4)?))
    }

    pub fn read_u64(&self, pos: usize) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.get(pos..pos + 8)?))
    }

    pub fn read_f32(&self, pos: usize) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.get(pos..pos + 4)?))
    }
}

impl AsRef<[u8]> for FileBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for FileBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBytes")
            .field("start", &self.start)
            .field("len", &self.len())
            .finish()
    }
}

/// A [`StorageInput`] reading from a [`FileBytes`] view.
#[derive(Debug)]
pub struct BytesInput {
    cursor: Cursor<FileBytes>,
}

impl BytesInput {
    pub fn new(bytes: FileBytes) -> Self {
        BytesInput {
            cursor: Cursor::new(bytes),
        }
    }
}

impl Read for BytesInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for BytesInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for BytesInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Configuration for storage backends.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-based storage configuration (includes path)
    File(file::FileStorageConfig),

    /// Memory-based storage configuration
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new storage instance with the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                let storage = memory::MemoryStorage::new(mem_config);
                Ok(Arc::new(storage))
            }
            StorageConfig::File(file_config) => {
                let storage = file::FileStorage::new(file_config)?;
                Ok(Arc::new(storage))
            }
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// File already exists.
    FileExists(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),

    /// Storage is closed.
    StorageClosed,

    /// Invalid operation.
    InvalidOperation(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::FileExists(name) => write!(f, "File already exists: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
            StorageError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for WhorlError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(_) => WhorlError::not_found(err.to_string()),
            StorageError::LockFailed(_) => WhorlError::lock(err.to_string()),
            _ => WhorlError::storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageConfig;
    use crate::storage::memory::MemoryStorageConfig;

    #[test]
    fn test_storage_config_default() {
        match StorageConfig::default() {
            StorageConfig::Memory(mem_config) => {
                assert_eq!(mem_config.initial_capacity, 16);
            }
            _ => panic!("Expected Memory config"),
        }
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("test.txt".to_string());
        assert_eq!(err.to_string(), "File not found: test.txt");

        let err = StorageError::FileExists("test.txt".to_string());
        assert_eq!(err.to_string(), "File already exists: test.txt");

        let err = StorageError::LockFailed("WRITELOCK".to_string());
        assert_eq!(err.to_string(), "Failed to acquire lock: WRITELOCK");

        let err: WhorlError = StorageError::FileNotFound("x".to_string()).into();
        assert!(matches!(err, WhorlError::NotFound(_)));
    }

    #[test]
    fn test_file_bytes_slicing() {
        let bytes = FileBytes::new(vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9]);
        let sub = bytes.slice(2..6).unwrap();
        assert_eq!(sub.as_slice(), &[3, 4, 5, 6]);

        let subsub = sub.slice(1..3).unwrap();
        assert_eq!(subsub.as_slice(), &[4, 5]);

        assert!(sub.slice(2..10).is_err());
        assert!(sub.get(3..5).is_err());
        assert_eq!(bytes.read_u32(0).unwrap(), u32::from_le_bytes([1, 2, 3, 4]));
    }

    #[test]
    fn test_bytes_input_reads_view() {
        let bytes = FileBytes::new(b"hello world".to_vec()).slice(6..11).unwrap();
        let mut input = BytesInput::new(bytes);
        let mut buffer = String::new();
        input.read_to_string(&mut buffer).unwrap();
        assert_eq!(buffer, "world");
        assert_eq!(input.size().unwrap(), 5);
    }

    #[test]
    fn test_storage_factory_memory() {
        let storage =
            StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default())).unwrap();
        assert!(!storage.file_exists("test.txt"));
    }

    #[test]
    fn test_storage_factory_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::File(FileStorageConfig::new(temp_dir.path()));
        let storage = StorageFactory::create(config).unwrap();

        let mut output = storage.create_output("test.bin").unwrap();
        output.write_all(b"Hello, Factory!").unwrap();
        output.close().unwrap();

        let bytes = storage.open_bytes("test.bin").unwrap();
        assert_eq!(bytes.as_slice(), b"Hello, Factory!");
    }
}
