//! In-memory storage implementation for tests and throwaway indexes.

use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{
    BytesInput, FileBytes, Storage, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// Configuration specific to memory-based storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file table.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 16,
        }
    }
}

type FileTable = Arc<Mutex<HashMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// Files become visible when their output is closed (or dropped), so a
/// half-written file is never observable under its final name.
#[derive(Debug)]
pub struct MemoryStorage {
    files: FileTable,
    locks: Arc<Mutex<HashSet<String>>>,
    closed: bool,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::with_capacity(config.initial_capacity))),
            locks: Arc::new(Mutex::new(HashSet::new())),
            closed: false,
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    fn data(&self, name: &str) -> Result<Arc<[u8]>> {
        self.check_closed()?;
        self.files
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()).into())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(BytesInput::new(self.open_bytes(name)?)))
    }

    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        Ok(FileBytes::new(self.data(name)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed {
            return false;
        }

        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        self.files
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()).into())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut file_names: Vec<String> = self.files.lock().keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        Ok(self.data(name)?.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str, overwrite: bool) -> Result<()> {
        self.check_closed()?;

        let mut files = self.files.lock();
        if !overwrite && files.contains_key(new_name) {
            return Err(StorageError::FileExists(new_name.to_string()).into());
        }
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;

        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn create_temp_output(&self, prefix: &str) -> Result<(String, Box<dyn StorageOutput>)> {
        self.check_closed()?;

        let temp_name = format!("{prefix}.{}.tmp", uuid::Uuid::new_v4().simple());
        let output = self.create_output(&temp_name)?;
        Ok((temp_name, output))
    }

    fn try_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>> {
        self.check_closed()?;

        let mut locks = self.locks.lock();
        if !locks.insert(name.to_string()) {
            return Ok(None);
        }

        Ok(Some(Box::new(MemoryLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            released: false,
        })))
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.locks.lock().clear();
        Ok(())
    }
}

/// A memory-based output. The buffer is published on close.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileTable,
    position: u64,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileTable) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            files,
            position: 0,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        let start = self.position as usize;
        let end = start + buf.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => (self.buffer.len() as u64).checked_add_signed(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
        };

        match new_pos {
            Some(p) => {
                self.position = p;
                Ok(p)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid seek position",
            )),
        }
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = std::mem::take(&mut self.buffer).into();
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A lock held in a shared in-process set.
#[derive(Debug)]
struct MemoryLock {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.locks.lock().remove(&self.name);
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_all(input: &mut dyn StorageInput) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    #[test]
    fn test_memory_storage_creation() {
        let storage = MemoryStorage::new_default();
        assert_eq!(storage.file_count(), 0);
        assert_eq!(storage.total_size(), 0);
    }

    #[test]
    fn test_create_and_read_file() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("test.txt").unwrap();
        output.write_all(b"Hello, Memory!").unwrap();
        assert!(!storage.file_exists("test.txt"));
        output.close().unwrap();

        let mut input = storage.open_input("test.txt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, Memory!");
        assert_eq!(input.size().unwrap(), 14);
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.total_size(), 14);
    }

    #[test]
    fn test_seek_and_overwrite() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("patch.bin").unwrap();
        output.write_all(b"aaaaaa").unwrap();
        output.seek(SeekFrom::Start(2)).unwrap();
        output.write_all(b"bb").unwrap();
        output.close().unwrap();

        assert_eq!(storage.open_bytes("patch.bin").unwrap().as_slice(), b"aabbaa");
    }

    #[test]
    fn test_rename_without_overwrite() {
        let storage = MemoryStorage::new_default();

        for name in ["a.tmp", "b"] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(name.as_bytes()).unwrap();
            output.close().unwrap();
        }

        assert!(storage.rename_file("a.tmp", "b", false).is_err());
        assert!(storage.file_exists("a.tmp"));

        storage.rename_file("a.tmp", "b", true).unwrap();
        assert!(!storage.file_exists("a.tmp"));
        assert_eq!(storage.open_bytes("b").unwrap().as_slice(), b"a.tmp");
    }

    #[test]
    fn test_temp_output_names_are_unique() {
        let storage = MemoryStorage::new_default();
        let (first, mut out1) = storage.create_temp_output("_main_1.toc").unwrap();
        let (second, mut out2) = storage.create_temp_output("_main_1.toc").unwrap();
        out1.close().unwrap();
        out2.close().unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with("_main_1.toc."));
        assert_eq!(read_all(&mut *storage.open_input(&first).unwrap()).unwrap(), b"");
    }

    #[test]
    fn test_locks() {
        let storage = MemoryStorage::new_default();

        let lock = storage.try_lock("WRITELOCK").unwrap();
        assert!(lock.is_some());
        assert!(storage.try_lock("WRITELOCK").unwrap().is_none());

        drop(lock);
        let mut again = storage.try_lock("WRITELOCK").unwrap().unwrap();
        assert_eq!(again.name(), "WRITELOCK");
        again.release().unwrap();
        assert!(!again.is_valid());
        assert!(storage.try_lock("WRITELOCK").unwrap().is_some());
    }

    #[test]
    fn test_storage_close() {
        let mut storage = MemoryStorage::new_default();
        storage.close().unwrap();
        assert!(storage.create_output("test.txt").is_err());
        assert!(!storage.file_exists("test.txt"));
    }
}
