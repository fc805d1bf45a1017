//! Compound segment files.
//!
//! A compound file packs all of a segment's files into one `.seg` file:
//!
//! ```text
//! file data, concatenated
//! directory: bincode BTreeMap<name, (offset, length)>
//! footer:    dir_pos: u64, dir_len: u32, magic "WSEG"
//! ```
//!
//! [`CompoundStorage`] exposes the packed files through the read side of the
//! [`Storage`] trait, so segment readers cannot tell the difference.

use std::collections::BTreeMap;
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;

use crate::error::{Result, WhorlError};
use crate::storage::{
    BytesInput, FileBytes, Storage, StorageError, StorageInput, StorageOutput,
};

pub const COMPOUND_EXT: &str = "seg";

const MAGIC: &[u8; 4] = b"WSEG";
const FOOTER_SIZE: usize = 8 + 4 + 4;

/// Packs files of `storage` into one compound file.
#[derive(Debug)]
pub struct CompoundWriter<'a> {
    storage: &'a dyn Storage,
    files: Vec<String>,
}

impl<'a> CompoundWriter<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        CompoundWriter {
            storage,
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, name: impl Into<String>) {
        self.files.push(name.into());
    }

    /// Write the compound file and delete the packed originals.
    pub fn write(self, name: &str) -> Result<()> {
        let mut output = self.storage.create_output(name)?;
        let mut directory: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        let mut position = 0u64;

        for file in &self.files {
            let bytes = self.storage.open_bytes(file)?;
            output.write_all(bytes.as_slice())?;
            directory.insert(file.clone(), (position, bytes.len() as u64));
            position += bytes.len() as u64;
        }

        let dir_bytes = bincode::serialize(&directory)?;
        output.write_all(&dir_bytes)?;
        output.write_u64::<LittleEndian>(position)?;
        output.write_u32::<LittleEndian>(dir_bytes.len() as u32)?;
        output.write_all(MAGIC)?;
        output.flush_and_sync()?;
        output.close()?;

        for file in &self.files {
            self.storage.delete_file(file)?;
        }
        debug!("packed {} files into {name}", self.files.len());
        Ok(())
    }
}

/// Read-only storage over the files inside a compound file.
#[derive(Debug, Clone)]
pub struct CompoundStorage {
    name: String,
    bytes: FileBytes,
    directory: BTreeMap<String, (u64, u64)>,
}

impl CompoundStorage {
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        let bytes = storage.open_bytes(name)?;
        let len = bytes.len();
        if len < FOOTER_SIZE || bytes.get(len - 4..len)? != MAGIC {
            return Err(WhorlError::format(format!("{name} is not a compound file")));
        }
        let dir_pos = bytes.read_u64(len - FOOTER_SIZE)? as usize;
        let dir_len = bytes.read_u32(len - FOOTER_SIZE + 8)? as usize;
        let directory = bincode::deserialize(bytes.get(dir_pos..dir_pos + dir_len)?)?;

        Ok(CompoundStorage {
            name: name.to_string(),
            bytes,
            directory,
        })
    }

    fn entry(&self, name: &str) -> Result<(u64, u64)> {
        self.directory
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()).into())
    }

    fn read_only(&self, operation: &str) -> WhorlError {
        StorageError::InvalidOperation(format!(
            "{operation} on read-only compound file {}",
            self.name
        ))
        .into()
    }
}

impl Storage for CompoundStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(BytesInput::new(self.open_bytes(name)?)))
    }

    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        let (offset, length) = self.entry(name)?;
        self.bytes
            .slice(offset as usize..(offset + length) as usize)
    }

    fn create_output(&self, _name: &str) -> Result<Box<dyn StorageOutput>> {
        Err(self.read_only("create_output"))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.directory.contains_key(name)
    }

    fn delete_file(&self, _name: &str) -> Result<()> {
        Err(self.read_only("delete_file"))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.directory.keys().cloned().collect())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        Ok(self.entry(name)?.1)
    }

    fn rename_file(&self, _old_name: &str, _new_name: &str, _overwrite: bool) -> Result<()> {
        Err(self.read_only("rename_file"))
    }

    fn create_temp_output(&self, _prefix: &str) -> Result<(String, Box<dyn StorageOutput>)> {
        Err(self.read_only("create_temp_output"))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::io::Read;

    fn put(storage: &MemoryStorage, name: &str, data: &[u8]) {
        let mut output = storage.create_output(name).unwrap();
        output.write_all(data).unwrap();
        output.close().unwrap();
    }

    #[test]
    fn test_pack_and_read() {
        let storage = MemoryStorage::new_default();
        put(&storage, "a.trm", b"terms");
        put(&storage, "a.pst", b"");
        put(&storage, "a.sto", b"stored fields");

        let mut writer = CompoundWriter::new(&storage);
        for name in ["a.trm", "a.pst", "a.sto"] {
            writer.add_file(name);
        }
        writer.write("a.seg").unwrap();
        assert!(!storage.file_exists("a.trm"));

        let compound = CompoundStorage::open(&storage, "a.seg").unwrap();
        assert_eq!(compound.list_files().unwrap(), vec!["a.pst", "a.sto", "a.trm"]);
        assert_eq!(compound.open_bytes("a.trm").unwrap().as_slice(), b"terms");
        assert!(compound.open_bytes("a.pst").unwrap().is_empty());
        assert_eq!(compound.file_size("a.sto").unwrap(), 13);

        let mut text = String::new();
        compound
            .open_input("a.sto")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "stored fields");

        assert!(matches!(
            compound.open_bytes("missing"),
            Err(WhorlError::NotFound(_))
        ));
        assert!(compound.create_output("x").is_err());
        assert!(compound.delete_file("a.trm").is_err());
    }

    #[test]
    fn test_bad_magic() {
        let storage = MemoryStorage::new_default();
        put(&storage, "b.seg", b"definitely not a compound file");
        assert!(matches!(
            CompoundStorage::open(&storage, "b.seg"),
            Err(WhorlError::Format(_))
        ));
    }
}
